use xmpp_parsers::{
  jingle_rtp::{PayloadType, RtcpMux},
  jingle_rtp_hdrext::RtpHdrext,
  ns::{JINGLE_RTP, JINGLE_RTP_HDREXT, JINGLE_SSMA},
};

use crate::jingle_ssma::Source;

generate_element!(
  /// Wrapper element describing an RTP session.
  Description, "description", JINGLE_RTP,
  attributes: [
      /// Which media type this session describes (audio or video).
      media: Required<String> = "media",
  ],
  children: [
      /// List of encodings that can be used for this RTP stream.
      payload_types: Vec<PayloadType> = ("payload-type", JINGLE_RTP) => PayloadType,

      /// Specifies the ability to multiplex RTP data and control packets on a single port.
      rtcp_mux: Option<RtcpMux> = ("rtcp-mux", JINGLE_RTP) => RtcpMux,

      /// List of ssrc.
      ssrcs: Vec<Source> = ("source", JINGLE_SSMA) => Source,

      /// List of header extensions.
      hdrexts: Vec<RtpHdrext> = ("rtp-hdrext", JINGLE_RTP_HDREXT) => RtpHdrext
  ]
);

impl Description {
  /// Create a new RTP description.
  pub fn new(media: String) -> Description {
    Description {
      media,
      payload_types: Vec::new(),
      rtcp_mux: None,
      ssrcs: Vec::new(),
      hdrexts: Vec::new(),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;
  use xmpp_parsers::Element;

  #[test]
  fn parse_audio_description() {
    let elem: Element = "<description xmlns='urn:xmpp:jingle:apps:rtp:1' media='audio'>
        <payload-type id='111' name='opus' clockrate='48000' channels='2'>
          <parameter name='minptime' value='10'/>
          <rtcp-fb xmlns='urn:xmpp:jingle:apps:rtp:rtcp-fb:0' type='transport-cc'/>
        </payload-type>
        <payload-type id='126' name='telephone-event' clockrate='8000'/>
        <rtcp-mux/>
        <source xmlns='urn:xmpp:jingle:apps:rtp:ssma:0' ssrc='3948959344'>
          <parameter name='cname' value='bob'/>
        </source>
      </description>"
      .parse()
      .unwrap();
    let description = Description::try_from(elem).unwrap();
    assert_eq!(description.media, "audio");
    assert_eq!(description.payload_types.len(), 2);
    assert_eq!(description.payload_types[0].id, 111);
    assert_eq!(description.payload_types[0].rtcp_fbs.len(), 1);
    assert!(description.rtcp_mux.is_some());
    assert_eq!(description.ssrcs.len(), 1);
    assert_eq!(description.ssrcs[0].ssrc(), Some(3948959344));
  }
}
