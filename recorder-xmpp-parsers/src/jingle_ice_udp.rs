use xmpp_parsers::{
  jingle_ice_udp::Candidate,
  ns::{JINGLE_DTLS, JINGLE_ICE_UDP},
};

use crate::jingle_dtls_srtp::Fingerprint;

generate_element!(
  /// Wrapper element for an ICE-UDP transport.
  #[derive(Default)]
  Transport, "transport", JINGLE_ICE_UDP,
  attributes: [
    /// A Password as defined in ICE-CORE.
    pwd: Option<String> = "pwd",

    /// A User Fragment as defined in ICE-CORE.
    ufrag: Option<String> = "ufrag",
  ],
  children: [
    /// List of candidates for this ICE-UDP session.
    candidates: Vec<Candidate> = ("candidate", JINGLE_ICE_UDP) => Candidate,

    /// Fingerprint of the key used for the DTLS handshake.
    fingerprint: Option<Fingerprint> = ("fingerprint", JINGLE_DTLS) => Fingerprint
  ]
);

impl Transport {
  /// Create a new ICE-UDP transport.
  pub fn new() -> Transport {
    Default::default()
  }

  /// Set the ICE credentials of this transport.
  pub fn with_credentials(mut self, ufrag: String, pwd: String) -> Self {
    self.ufrag = Some(ufrag);
    self.pwd = Some(pwd);
    self
  }

  /// Add a candidate to this transport.
  pub fn add_candidate(mut self, candidate: Candidate) -> Self {
    self.candidates.push(candidate);
    self
  }

  /// Set the DTLS-SRTP fingerprint of this transport.
  pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
    self.fingerprint = Some(fingerprint);
    self
  }
}

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;
  use xmpp_parsers::Element;

  #[test]
  fn parse_transport_with_candidate() {
    let elem: Element = "<transport xmlns='urn:xmpp:jingle:transports:ice-udp:1' ufrag='u1' pwd='p1'>
        <candidate component='1' foundation='1' generation='0' id='c1'
                   ip='198.51.100.7' port='10000' priority='2130706431' protocol='udp' type='host'/>
      </transport>"
      .parse()
      .unwrap();
    let transport = Transport::try_from(elem).unwrap();
    assert_eq!(transport.ufrag.as_deref(), Some("u1"));
    assert_eq!(transport.pwd.as_deref(), Some("p1"));
    assert_eq!(transport.candidates.len(), 1);
    assert_eq!(transport.candidates[0].port, 10000);
  }
}
