use std::convert::TryFrom;

use jid::Jid;
use xmpp_parsers::{
  iq::IqSetPayload,
  jingle::{ContentId, Creator, ReasonElement, Senders, SessionId},
  jingle_grouping::Group,
  ns::{JINGLE, JINGLE_GROUPING},
  Element, Error,
};

use crate::{
  focus::BridgeSession, jingle_ice_udp::Transport as IceUdpTransport,
  jingle_rtp::Description as RtpDescription, ns::JITSI_FOCUS,
};

generate_attribute!(
  /// The action attribute.
  Action, "action", {
      /// Definitively accept a session negotiation.
      SessionAccept => "session-accept",

      /// Send session-level information, such as a ping or a ringing message.
      SessionInfo => "session-info",

      /// Request negotiation of a new Jingle session.
      SessionInitiate => "session-initiate",

      /// End an existing session.
      SessionTerminate => "session-terminate",

      /// Exchange transport candidates.
      TransportInfo => "transport-info",

      /// --- Non-standard values used by Jitsi Meet: ---

      /// Add a source to existing content.
      SourceAdd => "source-add",

      /// Remove a source from existing content.
      SourceRemove => "source-remove",
  }
);

/// The main Jingle container, to be included in an iq stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Jingle {
  /// The action to execute on both ends.
  pub action: Action,

  /// Who the initiator is.
  pub initiator: Option<Jid>,

  /// Who the responder is.
  pub responder: Option<Jid>,

  /// Unique session identifier between two entities.
  pub sid: SessionId,

  /// A list of contents to be negotiated in this session.
  pub contents: Vec<Content>,

  /// An optional reason.
  pub reason: Option<ReasonElement>,

  /// An optional grouping.
  pub group: Option<Group>,

  /// The bridge conference backing this session, when Jicofo includes it.
  pub bridge_session: Option<BridgeSession>,

  /// Payloads to be included.
  pub other: Vec<Element>,
}

impl IqSetPayload for Jingle {}

impl Jingle {
  /// Create a new Jingle element.
  pub fn new(action: Action, sid: SessionId) -> Jingle {
    Jingle {
      action,
      sid,
      initiator: None,
      responder: None,
      contents: Vec::new(),
      reason: None,
      group: None,
      bridge_session: None,
      other: Vec::new(),
    }
  }

  /// Set the initiator’s JID.
  pub fn with_initiator(mut self, initiator: Jid) -> Jingle {
    self.initiator = Some(initiator);
    self
  }

  /// Set the responder’s JID.
  pub fn with_responder(mut self, responder: Jid) -> Jingle {
    self.responder = Some(responder);
    self
  }

  /// Add a content to this Jingle container.
  pub fn add_content(mut self, content: Content) -> Jingle {
    self.contents.push(content);
    self
  }

  /// Set the grouping in this Jingle container.
  pub fn set_group(mut self, group: Group) -> Jingle {
    self.group = Some(group);
    self
  }
}

impl TryFrom<Element> for Jingle {
  type Error = Error;

  fn try_from(root: Element) -> Result<Jingle, Error> {
    check_self!(root, "jingle", JINGLE, "Jingle");

    let mut jingle = Jingle {
      action: get_attr!(root, "action", Required),
      initiator: get_attr!(root, "initiator", Option),
      responder: get_attr!(root, "responder", Option),
      sid: get_attr!(root, "sid", Required),
      contents: vec![],
      reason: None,
      group: None,
      bridge_session: None,
      other: vec![],
    };

    for child in root.children().cloned() {
      if child.is("content", JINGLE) {
        let content = Content::try_from(child)?;
        jingle.contents.push(content);
      }
      else if child.is("reason", JINGLE) {
        if jingle.reason.is_some() {
          return Err(Error::ParseError(
            "Jingle must not have more than one reason.",
          ));
        }
        jingle.reason = Some(ReasonElement::try_from(child)?);
      }
      else if child.is("group", JINGLE_GROUPING) {
        if jingle.group.is_some() {
          return Err(Error::ParseError(
            "Jingle must not have more than one grouping.",
          ));
        }
        jingle.group = Some(Group::try_from(child)?);
      }
      else if child.is("bridge-session", JITSI_FOCUS) {
        jingle.bridge_session = Some(BridgeSession::try_from(child)?);
      }
      else {
        jingle.other.push(child);
      }
    }

    Ok(jingle)
  }
}

impl From<Jingle> for Element {
  fn from(jingle: Jingle) -> Element {
    Element::builder("jingle", JINGLE)
      .attr("action", jingle.action)
      .attr("initiator", jingle.initiator)
      .attr("responder", jingle.responder)
      .attr("sid", jingle.sid)
      .append_all(jingle.group.map(Element::from))
      .append_all(jingle.contents)
      .append_all(jingle.reason.map(Element::from))
      .append_all(jingle.bridge_session.map(Element::from))
      .build()
  }
}

/// Enum wrapping the description kinds a Content can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Description {
  /// Jingle RTP Sessions (XEP-0167) description.
  Rtp(RtpDescription),

  /// To be used for any description that isn’t known at compile-time.
  Unknown(Element),
}

impl TryFrom<Element> for Description {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Description, Error> {
    Ok(if elem.is("description", xmpp_parsers::ns::JINGLE_RTP) {
      Description::Rtp(RtpDescription::try_from(elem)?)
    }
    else {
      Description::Unknown(elem)
    })
  }
}

impl From<RtpDescription> for Description {
  fn from(desc: RtpDescription) -> Description {
    Description::Rtp(desc)
  }
}

impl From<Description> for Element {
  fn from(desc: Description) -> Element {
    match desc {
      Description::Rtp(desc) => desc.into(),
      Description::Unknown(elem) => elem,
    }
  }
}

/// Enum wrapping the transport kinds a Content can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
  /// Jingle ICE-UDP (XEP-0176) transport.
  IceUdp(IceUdpTransport),

  /// To be used for any transport that isn’t known at compile-time.
  Unknown(Element),
}

impl TryFrom<Element> for Transport {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Transport, Error> {
    Ok(
      if elem.is("transport", xmpp_parsers::ns::JINGLE_ICE_UDP) {
        Transport::IceUdp(IceUdpTransport::try_from(elem)?)
      }
      else {
        Transport::Unknown(elem)
      },
    )
  }
}

impl From<IceUdpTransport> for Transport {
  fn from(transport: IceUdpTransport) -> Transport {
    Transport::IceUdp(transport)
  }
}

impl From<Transport> for Element {
  fn from(transport: Transport) -> Element {
    match transport {
      Transport::IceUdp(transport) => transport.into(),
      Transport::Unknown(elem) => elem,
    }
  }
}

generate_element!(
  /// Describes a session’s content, there can be multiple content in one
  /// session.
  Content, "content", JINGLE,
  attributes: [
      /// Who created this content.
      creator: Option<Creator> = "creator",

      /// A per-session unique identifier for this content.
      name: Required<ContentId> = "name",

      /// Who can send data for this content.
      senders: Option<Senders> = "senders",
  ],
  children: [
      /// What to send.
      description: Option<Description> = ("description", *) => Description,

      /// How to send it.
      transport: Option<Transport> = ("transport", *) => Transport
  ]
);

impl Content {
  /// Create a new content.
  pub fn new(creator: Creator, name: ContentId) -> Content {
    Content {
      creator: Some(creator),
      name,
      senders: Some(Senders::Both),
      description: None,
      transport: None,
    }
  }

  /// Specify who can send data for this content.
  pub fn with_senders(mut self, senders: Senders) -> Content {
    self.senders = Some(senders);
    self
  }

  /// Set the description of this content.
  pub fn with_description<D: Into<Description>>(mut self, description: D) -> Content {
    self.description = Some(description.into());
    self
  }

  /// Set the transport of this content.
  pub fn with_transport<T: Into<Transport>>(mut self, transport: T) -> Content {
    self.transport = Some(transport.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_session_initiate() {
    let elem: Element = "<jingle xmlns='urn:xmpp:jingle:1' action='session-initiate' sid='sid1'
              initiator='focus@auth.example/focus'>
        <content xmlns='urn:xmpp:jingle:1' creator='initiator' name='audio' senders='both'>
          <description xmlns='urn:xmpp:jingle:apps:rtp:1' media='audio'>
            <payload-type id='111' name='opus' clockrate='48000' channels='2'/>
          </description>
          <transport xmlns='urn:xmpp:jingle:transports:ice-udp:1' ufrag='abcd' pwd='efgh'/>
        </content>
        <group xmlns='urn:xmpp:jingle:apps:grouping:0' semantics='BUNDLE'>
          <content name='audio'/>
        </group>
        <bridge-session xmlns='http://jitsi.org/protocol/focus' id='conf-42'/>
      </jingle>"
      .parse()
      .unwrap();
    let jingle = Jingle::try_from(elem).unwrap();
    assert_eq!(jingle.action, Action::SessionInitiate);
    assert_eq!(jingle.sid.0, "sid1");
    assert_eq!(jingle.contents.len(), 1);
    assert_eq!(jingle.bridge_session.as_ref().unwrap().id, "conf-42");
    assert!(jingle.group.is_some());
    match jingle.contents[0].description.as_ref().unwrap() {
      Description::Rtp(desc) => assert_eq!(desc.media, "audio"),
      other => panic!("unexpected description: {:?}", other),
    }
    match jingle.contents[0].transport.as_ref().unwrap() {
      Transport::IceUdp(transport) => assert_eq!(transport.ufrag.as_deref(), Some("abcd")),
      other => panic!("unexpected transport: {:?}", other),
    }
  }
}
