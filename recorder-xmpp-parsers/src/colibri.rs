use xmpp_parsers::iq::{IqResultPayload, IqSetPayload};

use crate::{jingle_ice_udp::Transport as IceUdpTransport, ns::COLIBRI};

generate_attribute!(
  /// Whether the requester is the ICE controlling agent; omitted when false.
  Initiator, "initiator", bool
);

generate_element!(
  /// Colibri v1 conference root, carried in an iq stanza.
  ///
  /// An allocation request omits the id and lets the bridge create the
  /// conference; the reply carries the assigned id back.
  Conference, "conference", COLIBRI,
  attributes: [
    /// The bridge-assigned conference identifier.
    id: Option<String> = "id",
  ],
  children: [
    /// Per-media-type channel groups.
    contents: Vec<Content> = ("content", COLIBRI) => Content
  ]
);

impl IqSetPayload for Conference {}
impl IqResultPayload for Conference {}

impl Conference {
  /// Create a conference request, with or without a known conference id.
  pub fn new(id: Option<String>) -> Conference {
    Conference {
      id,
      contents: Vec::new(),
    }
  }

  /// Add a content to this conference.
  pub fn add_content(mut self, content: Content) -> Conference {
    self.contents.push(content);
    self
  }

  /// The first channel of the first content, however the bridge nested it.
  pub fn first_channel(&self) -> Option<&Channel> {
    self.contents.iter().flat_map(|c| c.channels.iter()).next()
  }
}

generate_element!(
  /// A media-type group of channels within a v1 conference.
  Content, "content", COLIBRI,
  attributes: [
    /// The media type this content carries ("audio" or "video").
    name: Required<String> = "name",
  ],
  children: [
    /// The channels allocated under this content.
    channels: Vec<Channel> = ("channel", COLIBRI) => Channel
  ]
);

impl Content {
  /// Create a new content for the given media type.
  pub fn new(name: String) -> Content {
    Content {
      name,
      channels: Vec::new(),
    }
  }

  /// Add a channel to this content.
  pub fn add_channel(mut self, channel: Channel) -> Content {
    self.channels.push(channel);
    self
  }
}

generate_element!(
  /// A v1 bridge channel: one media relay for one endpoint.
  ///
  /// Setting expire to zero releases the channel.
  #[derive(Default)]
  Channel, "channel", COLIBRI,
  attributes: [
    /// The bridge-assigned channel identifier.
    id: Option<String> = "id",

    /// The endpoint this channel belongs to.
    endpoint: Option<String> = "endpoint",

    /// Whether the requester is the ICE controlling agent.
    initiator: Default<Initiator> = "initiator",

    /// Channel lifetime in seconds; zero expires the channel.
    expire: Option<u32> = "expire",
  ],
  children: [
    /// Payload types the channel should relay.
    payload_types: Vec<PayloadType> = ("payload-type", COLIBRI) => PayloadType,

    /// The ICE-UDP transport of this channel.
    transport: Option<IceUdpTransport> = ("transport", *) => IceUdpTransport
  ]
);

impl Channel {
  /// Create a channel allocation request.
  pub fn new(expire: u32) -> Channel {
    Channel {
      id: None,
      endpoint: None,
      initiator: Initiator::True,
      expire: Some(expire),
      payload_types: Vec::new(),
      transport: None,
    }
  }

  /// Create a channel expiry request for a known channel id.
  pub fn expired(id: String) -> Channel {
    Channel {
      id: Some(id),
      endpoint: None,
      initiator: Initiator::False,
      expire: Some(0),
      payload_types: Vec::new(),
      transport: None,
    }
  }

  /// Add a payload type to this channel.
  pub fn add_payload_type(mut self, payload_type: PayloadType) -> Channel {
    self.payload_types.push(payload_type);
    self
  }

  /// Set the transport of this channel.
  pub fn with_transport(mut self, transport: IceUdpTransport) -> Channel {
    self.transport = Some(transport);
    self
  }
}

generate_element!(
  /// A payload type in the v1 dialect; unlike Jingle's, these live in the
  /// colibri namespace.
  PayloadType, "payload-type", COLIBRI,
  attributes: [
    /// The RTP payload type number.
    id: Required<u8> = "id",

    /// The codec name.
    name: Required<String> = "name",

    /// The sampling clock rate.
    clockrate: Option<u32> = "clockrate",

    /// The number of channels (2 for stereo opus).
    channels: Option<u8> = "channels",
  ]
);

impl PayloadType {
  /// Create a new payload type.
  pub fn new(id: u8, name: String, clockrate: u32, channels: u8) -> PayloadType {
    PayloadType {
      id,
      name,
      clockrate: Some(clockrate),
      channels: Some(channels),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;
  use xmpp_parsers::Element;

  #[test]
  fn serialise_allocate_request() {
    let conference = Conference::new(None).add_content(
      Content::new("audio".to_owned()).add_channel(
        Channel::new(180)
          .add_payload_type(PayloadType::new(111, "opus".to_owned(), 48000, 2))
          .with_transport(IceUdpTransport::new()),
      ),
    );
    let elem: Element = conference.into();
    assert!(elem.is("conference", COLIBRI));
    assert_eq!(elem.attr("id"), None);
    let content = elem.children().next().unwrap();
    assert_eq!(content.attr("name"), Some("audio"));
    let channel = content.children().next().unwrap();
    assert_eq!(channel.attr("expire"), Some("180"));
    assert_eq!(channel.attr("initiator"), Some("true"));
  }

  #[test]
  fn parse_allocate_reply() {
    let elem: Element = "<conference xmlns='http://jitsi.org/protocol/colibri' id='abc123'>
        <content name='audio'>
          <channel id='chan1' endpoint='p1' expire='180'>
            <payload-type id='111' name='opus' clockrate='48000' channels='2'/>
            <transport xmlns='urn:xmpp:jingle:transports:ice-udp:1' ufrag='uf' pwd='pw'>
              <candidate component='1' foundation='1' generation='0' id='c1'
                         ip='203.0.113.5' port='10000' priority='2130706431'
                         protocol='udp' type='host'/>
            </transport>
          </channel>
        </content>
      </conference>"
      .parse()
      .unwrap();
    let conference = Conference::try_from(elem).unwrap();
    assert_eq!(conference.id.as_deref(), Some("abc123"));
    let channel = conference.first_channel().unwrap();
    assert_eq!(channel.id.as_deref(), Some("chan1"));
    let transport = channel.transport.as_ref().unwrap();
    assert_eq!(transport.ufrag.as_deref(), Some("uf"));
    assert_eq!(transport.candidates[0].port, 10000);
  }
}
