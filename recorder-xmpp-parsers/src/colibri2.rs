use minidom::NSChoice::Any;
use xmpp_parsers::{
  iq::{IqResultPayload, IqSetPayload},
  ns::JINGLE_SSMA,
  Element,
};

use crate::{
  jingle_ice_udp::Transport as IceUdpTransport, jingle_ssma::Source, ns::COLIBRI2,
};

generate_attribute!(
  /// Asks the bridge to create the conference or endpoint; omitted when false.
  Create, "create", bool
);

generate_attribute!(
  /// Asks the bridge to expire the endpoint; omitted when false.
  Expire, "expire", bool
);

generate_element!(
  /// Colibri v2 conference-modify request, carried in an iq stanza.
  ConferenceModify, "conference-modify", COLIBRI2,
  attributes: [
    /// The meeting identifier shared between signalling and the bridge.
    meeting_id: Required<String> = "meeting-id",

    /// The conference name (the full MUC JID), when known.
    name: Option<String> = "name",

    /// Whether the bridge should create the conference if missing.
    create: Default<Create> = "create",
  ],
  children: [
    /// The endpoints being created, modified or expired.
    endpoints: Vec<Endpoint> = ("endpoint", COLIBRI2) => Endpoint
  ]
);

impl IqSetPayload for ConferenceModify {}

impl ConferenceModify {
  /// Create a conference-modify request.
  pub fn new(meeting_id: String, create: bool) -> ConferenceModify {
    ConferenceModify {
      meeting_id,
      name: None,
      create: if create { Create::True } else { Create::False },
      endpoints: Vec::new(),
    }
  }

  /// Set the conference name.
  pub fn with_name(mut self, name: String) -> ConferenceModify {
    self.name = Some(name);
    self
  }

  /// Add an endpoint to this request.
  pub fn add_endpoint(mut self, endpoint: Endpoint) -> ConferenceModify {
    self.endpoints.push(endpoint);
    self
  }
}

generate_element!(
  /// Colibri v2 conference-modified reply.
  ConferenceModified, "conference-modified", COLIBRI2,
  attributes: [
    /// The meeting identifier the bridge acted on.
    meeting_id: Option<String> = "meeting-id",
  ],
  children: [
    /// Endpoint state as the bridge sees it after the modification.
    endpoints: Vec<Endpoint> = ("endpoint", COLIBRI2) => Endpoint
  ]
);

impl IqResultPayload for ConferenceModified {}

impl ConferenceModified {
  /// The first ICE candidate the bridge returned, if any.
  pub fn first_candidate(&self) -> Option<&xmpp_parsers::jingle_ice_udp::Candidate> {
    self
      .endpoints
      .iter()
      .filter_map(|ep| ep.transport.as_ref())
      .filter_map(|t| t.ice_udp.as_ref())
      .flat_map(|t| t.candidates.iter())
      .next()
  }

  /// The first SSMA source the bridge returned, if any.
  pub fn first_source(&self) -> Option<&Source> {
    self
      .endpoints
      .iter()
      .flat_map(|ep| ep.media.iter())
      .flat_map(|m| m.sources.iter())
      .next()
  }

  /// The first payload type id the bridge returned, if any.
  pub fn first_payload_type_id(&self) -> Option<u8> {
    self
      .endpoints
      .iter()
      .flat_map(|ep| ep.media.iter())
      .flat_map(|m| m.payload_types.iter())
      .map(|pt| pt.id)
      .next()
  }
}

generate_element!(
  /// A v2 endpoint: the bridge-side representation of one participant.
  Endpoint, "endpoint", COLIBRI2,
  attributes: [
    /// The endpoint identifier.
    id: Required<String> = "id",

    /// Whether the bridge should create this endpoint.
    create: Default<Create> = "create",

    /// Whether the bridge should expire this endpoint.
    expire: Default<Expire> = "expire",
  ],
  children: [
    /// Media descriptions for this endpoint.
    media: Vec<Media> = ("media", COLIBRI2) => Media,

    /// The transport wrapper of this endpoint.
    transport: Option<Transport> = ("transport", COLIBRI2) => Transport
  ]
);

impl Endpoint {
  /// Create an endpoint creation request.
  pub fn new(id: String) -> Endpoint {
    Endpoint {
      id,
      create: Create::True,
      expire: Expire::False,
      media: Vec::new(),
      transport: None,
    }
  }

  /// Create an endpoint expiry request.
  pub fn expired(id: String) -> Endpoint {
    Endpoint {
      id,
      create: Create::False,
      expire: Expire::True,
      media: Vec::new(),
      transport: None,
    }
  }

  /// Add a media description to this endpoint.
  pub fn add_media(mut self, media: Media) -> Endpoint {
    self.media.push(media);
    self
  }

  /// Set the transport of this endpoint.
  pub fn with_transport(mut self, transport: Transport) -> Endpoint {
    self.transport = Some(transport);
    self
  }
}

generate_element!(
  /// A media description within a v2 endpoint.
  Media, "media", COLIBRI2,
  attributes: [
    /// The media type ("audio" or "video").
    type_: Required<String> = "type",
  ],
  children: [
    /// Payload types for this media.
    payload_types: Vec<PayloadType> = ("payload-type", *) => PayloadType,

    /// SSMA sources for this media.
    sources: Vec<Source> = ("source", JINGLE_SSMA) => Source
  ]
);

impl Media {
  /// Create a media description of the given type.
  pub fn new(type_: String) -> Media {
    Media {
      type_,
      payload_types: Vec::new(),
      sources: Vec::new(),
    }
  }

  /// Add a payload type to this media.
  pub fn add_payload_type(mut self, payload_type: PayloadType) -> Media {
    self.payload_types.push(payload_type);
    self
  }
}

/// A payload type in the v2 dialect.
///
/// Bridges vary in which namespace they emit these under, so parsing accepts
/// any namespace; serialisation uses the colibri2 one.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadType {
  pub id: u8,
  pub name: Option<String>,
  pub clockrate: Option<u32>,
  pub channels: Option<u8>,
}

impl PayloadType {
  /// Create a new payload type.
  pub fn new(id: u8, name: String, clockrate: u32, channels: u8) -> PayloadType {
    PayloadType {
      id,
      name: Some(name),
      clockrate: Some(clockrate),
      channels: Some(channels),
    }
  }
}

impl TryFrom<Element> for PayloadType {
  type Error = xmpp_parsers::Error;

  fn try_from(root: Element) -> Result<PayloadType, xmpp_parsers::Error> {
    check_self!(root, "payload-type", Any, "PayloadType");
    Ok(PayloadType {
      id: get_attr!(root, "id", Required),
      name: get_attr!(root, "name", Option),
      clockrate: get_attr!(root, "clockrate", Option),
      channels: get_attr!(root, "channels", Option),
    })
  }
}

impl From<PayloadType> for Element {
  fn from(payload_type: PayloadType) -> Element {
    Element::builder("payload-type", COLIBRI2)
      .attr("id", payload_type.id)
      .attr("name", payload_type.name)
      .attr("clockrate", payload_type.clockrate)
      .attr("channels", payload_type.channels)
      .build()
  }
}

generate_element!(
  /// The v2 transport wrapper; the actual ICE-UDP transport nests inside.
  #[derive(Default)]
  Transport, "transport", COLIBRI2,
  attributes: [],
  children: [
    /// The nested ICE-UDP transport, when the bridge included one.
    ice_udp: Option<IceUdpTransport> = ("transport", *) => IceUdpTransport
  ]
);

impl Transport {
  /// Create an empty transport request.
  pub fn new() -> Transport {
    Default::default()
  }
}

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;
  use xmpp_parsers::Element;

  #[test]
  fn serialise_allocate_request() {
    let request = ConferenceModify::new("meeting-1".to_owned(), true).add_endpoint(
      Endpoint::new("p1".to_owned())
        .add_media(
          Media::new("audio".to_owned())
            .add_payload_type(PayloadType::new(111, "opus".to_owned(), 48000, 2)),
        )
        .with_transport(Transport::new()),
    );
    let elem: Element = request.into();
    assert!(elem.is("conference-modify", COLIBRI2));
    assert_eq!(elem.attr("meeting-id"), Some("meeting-1"));
    assert_eq!(elem.attr("create"), Some("true"));
    let endpoint = elem.children().next().unwrap();
    assert_eq!(endpoint.attr("id"), Some("p1"));
    assert_eq!(endpoint.attr("create"), Some("true"));
    assert_eq!(endpoint.attr("expire"), None);
  }

  #[test]
  fn serialise_release_request() {
    let request = ConferenceModify::new("meeting-1".to_owned(), false)
      .add_endpoint(Endpoint::expired("p1".to_owned()));
    let elem: Element = request.into();
    assert_eq!(elem.attr("create"), None);
    let endpoint = elem.children().next().unwrap();
    assert_eq!(endpoint.attr("expire"), Some("true"));
    assert_eq!(endpoint.attr("create"), None);
  }

  #[test]
  fn parse_modified_reply() {
    let elem: Element = "<conference-modified xmlns='urn:xmpp:jitsi-videobridge:colibri2' meeting-id='meeting-1'>
        <endpoint id='p1'>
          <media type='audio'>
            <payload-type xmlns='urn:xmpp:jingle:apps:rtp:1' id='111' name='opus' clockrate='48000' channels='2'/>
            <source xmlns='urn:xmpp:jingle:apps:rtp:ssma:0' ssrc='555666'/>
          </media>
          <transport>
            <transport xmlns='urn:xmpp:jingle:transports:ice-udp:1' ufrag='uf2' pwd='pw2'>
              <candidate component='1' foundation='1' generation='0' id='c2'
                         ip='198.51.100.9' port='50002' priority='2130706431'
                         protocol='udp' type='host'/>
            </transport>
          </transport>
        </endpoint>
      </conference-modified>"
      .parse()
      .unwrap();
    let reply = ConferenceModified::try_from(elem).unwrap();
    assert_eq!(reply.meeting_id.as_deref(), Some("meeting-1"));
    let candidate = reply.first_candidate().unwrap();
    assert_eq!(candidate.port, 50002);
    assert_eq!(reply.first_source().unwrap().ssrc(), Some(555666));
    assert_eq!(reply.first_payload_type_id(), Some(111));
  }
}
