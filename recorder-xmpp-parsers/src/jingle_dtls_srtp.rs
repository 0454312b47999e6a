use xmpp_parsers::{
  hashes::{Algo, Hash},
  jingle_dtls_srtp::Setup,
  ns::JINGLE_DTLS,
  Error,
};

use crate::helpers::ColonSeparatedHex;

generate_element!(
  /// Fingerprint of the key used for a DTLS handshake.
  Fingerprint, "fingerprint", JINGLE_DTLS,
  attributes: [
      /// The hash algorithm used for this fingerprint.
      hash: Required<Algo> = "hash",

      /// Indicates which of the end points should initiate the connection establishment.
      setup: Option<Setup> = "setup"
  ],
  text: (
      /// Hash value of this fingerprint.
      value: ColonSeparatedHex<Vec<u8>>
  )
);

impl Fingerprint {
  /// Create a new Fingerprint from a Setup and a Hash.
  pub fn from_hash(setup: Setup, hash: Hash) -> Fingerprint {
    Fingerprint {
      hash: hash.algo,
      setup: Some(setup),
      value: hash.hash,
    }
  }

  /// Create a new Fingerprint from a Setup and parsing the hash.
  pub fn from_colon_separated_hex(
    setup: Setup,
    algo: &str,
    hash: &str,
  ) -> Result<Fingerprint, Error> {
    let algo = algo.parse()?;
    let hash = Hash::from_colon_separated_hex(algo, hash)?;
    Ok(Fingerprint::from_hash(setup, hash))
  }
}

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;
  use xmpp_parsers::Element;

  #[test]
  fn parse_fingerprint() {
    let elem: Element =
      "<fingerprint xmlns='urn:xmpp:jingle:apps:dtls:0' hash='sha-256' setup='actpass'>02:1A:CC:54:27:AB:EB:9C:53:3F:3E:4B:65:2E:7D:46:3F:54:42:CD:54:F1:7A:03:A2:7D:F9:B0:7F:46:19:B2</fingerprint>"
        .parse()
        .unwrap();
    let fingerprint = Fingerprint::try_from(elem).unwrap();
    assert_eq!(fingerprint.hash, Algo::Sha_256);
    assert_eq!(fingerprint.setup, Some(Setup::Actpass));
    assert_eq!(fingerprint.value.len(), 32);
  }

  #[test]
  fn serialise_round_trip() {
    let fingerprint =
      Fingerprint::from_colon_separated_hex(Setup::Active, "sha-256", "0A:FF:12:34").unwrap();
    let elem: Element = fingerprint.clone().into();
    let parsed = Fingerprint::try_from(elem).unwrap();
    assert_eq!(parsed, fingerprint);
  }
}
