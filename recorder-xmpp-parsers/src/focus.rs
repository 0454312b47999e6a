use crate::ns::JITSI_FOCUS;

generate_element!(
  /// Identifies the bridge conference backing a Jingle session.
  ///
  /// Jicofo attaches this to session-initiate so that endpoints can correlate
  /// the signalling session with the videobridge conference.
  BridgeSession, "bridge-session", JITSI_FOCUS,
  attributes: [
    /// The bridge-side conference identifier.
    id: Required<String> = "id",

    /// The region the conference is hosted in, if any.
    region: Option<String> = "region"
  ]
);

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;
  use xmpp_parsers::Element;

  #[test]
  fn parse_bridge_session() {
    let elem: Element =
      "<bridge-session xmlns='http://jitsi.org/protocol/focus' id='8d2ac90e' region='eu'/>"
        .parse()
        .unwrap();
    let session = BridgeSession::try_from(elem).unwrap();
    assert_eq!(session.id, "8d2ac90e");
    assert_eq!(session.region.as_deref(), Some("eu"));
  }
}
