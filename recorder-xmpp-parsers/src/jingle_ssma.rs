use minidom::{Element, NSChoice::Any};
use xmpp_parsers::ns::JINGLE_SSMA;

use crate::ns::JITSI_MEET;

generate_element!(
  /// Source element for the ssrc SDP attribute.
  Source, "source", JINGLE_SSMA,
  attributes: [
    /// Maps to the ssrc-id parameter. Kept as a string so that one malformed
    /// source does not fail the whole stanza; use [`Source::ssrc`] for the
    /// numeric value.
    id: Required<String> = "ssrc",
  ],
  children: [
    /// List of attributes for this source.
    // The namespace should be JINGLE_SSMA, but we have to use Any because Jicofo produces
    // parameters with the wrong namespace.
    // https://github.com/jitsi/jitsi-xmpp-extensions/issues/81
    parameters: Vec<Parameter> = ("parameter", Any) => Parameter,

    /// ssrc-info for this source (non-standard, used by Jitsi Meet).
    info: Option<SsrcInfo> = ("ssrc-info", JITSI_MEET) => SsrcInfo
  ]
);

impl Source {
  /// Create a new SSMA Source element.
  pub fn new(id: String) -> Source {
    Source {
      id,
      parameters: Vec::new(),
      info: None,
    }
  }

  /// The numeric SSRC, when the id is well-formed.
  pub fn ssrc(&self) -> Option<u32> {
    self.id.parse().ok()
  }

  /// Look up a parameter value by name.
  pub fn parameter(&self, name: &str) -> Option<&str> {
    self
      .parameters
      .iter()
      .find(|p| p.name == name)
      .and_then(|p| p.value.as_deref())
  }
}

/// Parameter associated with a ssrc.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
  pub name: String,
  pub value: Option<String>,
}

impl TryFrom<Element> for Parameter {
  type Error = xmpp_parsers::Error;

  fn try_from(root: Element) -> Result<Parameter, xmpp_parsers::Error> {
    // NSChoice::Any for the same Jicofo compatibility reason as above.
    check_self!(root, "parameter", Any, "Parameter");
    Ok(Parameter {
      name: get_attr!(root, "name", Required),
      value: get_attr!(root, "value", Option),
    })
  }
}

impl From<Parameter> for Element {
  fn from(parameter: Parameter) -> Element {
    Element::builder("parameter", JINGLE_SSMA)
      .attr("name", parameter.name)
      .attr("value", parameter.value)
      .build()
  }
}

generate_element!(
  /// ssrc-info associated with a ssrc.
  SsrcInfo, "ssrc-info", JITSI_MEET,
  attributes: [
    /// The owner of the ssrc.
    owner: Required<String> = "owner"
  ]
);

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;

  #[test]
  fn parse_source_with_parameters() {
    let elem: Element = "<source xmlns='urn:xmpp:jingle:apps:rtp:ssma:0' ssrc='1234567'>
        <parameter name='cname' value='alice'/>
        <parameter name='msid' value='X Y'/>
      </source>"
      .parse()
      .unwrap();
    let source = Source::try_from(elem).unwrap();
    assert_eq!(source.ssrc(), Some(1234567));
    assert_eq!(source.parameter("cname"), Some("alice"));
    assert_eq!(source.parameter("msid"), Some("X Y"));
    assert_eq!(source.parameter("mslabel"), None);
  }

  #[test]
  fn parse_source_with_info() {
    let elem: Element = "<source xmlns='urn:xmpp:jingle:apps:rtp:ssma:0' ssrc='98765'>
        <ssrc-info xmlns='http://jitsi.org/jitmeet' owner='room@muc.example/abcd1234'/>
      </source>"
      .parse()
      .unwrap();
    let source = Source::try_from(elem).unwrap();
    assert_eq!(
      source.info.unwrap().owner,
      "room@muc.example/abcd1234".to_owned()
    );
  }
}
