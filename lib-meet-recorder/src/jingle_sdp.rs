//! Conversion between Jingle stanzas as Jicofo emits them and the SDP blobs
//! the media plane consumes, plus SSRC extraction for participant tracking.

use std::collections::HashMap;

use anyhow::{Context, Result};
use itertools::Itertools;
use once_cell::sync::Lazy;
use recorder_xmpp_parsers::{
  jingle::{Action, Content, Description, Jingle, Transport},
  jingle_dtls_srtp::Fingerprint,
  jingle_ice_udp::Transport as IceUdpTransport,
  jingle_rtp::Description as RtpDescription,
};
use regex::Regex;
use xmpp_parsers::{
  jingle::{ContentId, Creator, Senders, SessionId},
  jingle_dtls_srtp::Setup,
  jingle_grouping::{self, Group, Semantics},
  jingle_rtcp_fb::RtcpFb,
  jingle_rtp::{Parameter as RtpParameter, PayloadType},
  jingle_rtp_hdrext::RtpHdrext,
  Jid,
};

use crate::source::{MediaType, SsrcDescription};

/// Codecs that never appear in the m= format list nor as rtpmap lines.
const EXCLUDED_CODECS: [&str; 3] = ["rtx", "red", "ulpfec"];

fn codec_excluded(name: Option<&str>) -> bool {
  name.map(|n| EXCLUDED_CODECS.contains(&n)).unwrap_or(false)
}

fn fingerprint_hex(value: &[u8]) -> String {
  itertools::join(value.iter().map(|byte| format!("{:02X}", byte)), ":")
}

/// Render a Jingle offer as an SDP blob.
///
/// Contents without an RTP description or an ICE-UDP transport are skipped;
/// the stanza as a whole never errors here.
pub fn jingle_to_sdp(jingle: &Jingle) -> String {
  let mut lines: Vec<String> = vec![
    "v=0".to_owned(),
    "o=- 0 0 IN IP4 0.0.0.0".to_owned(),
    "s=-".to_owned(),
    "t=0 0".to_owned(),
  ];

  let bundle_mids: Vec<&str> = jingle
    .contents
    .iter()
    .map(|content| content.name.0.as_str())
    .collect();
  if !bundle_mids.is_empty() {
    lines.push(format!("a=group:BUNDLE {}", bundle_mids.join(" ")));
  }

  for content in &jingle.contents {
    let description = match &content.description {
      Some(Description::Rtp(description)) => description,
      _ => continue,
    };
    let transport = match &content.transport {
      Some(Transport::IceUdp(transport)) => transport,
      _ => continue,
    };

    let fmt_list = description
      .payload_types
      .iter()
      .filter(|pt| !codec_excluded(pt.name.as_deref()))
      .map(|pt| pt.id.to_string())
      .join(" ");
    lines.push(format!(
      "m={} 9 UDP/TLS/RTP/SAVPF {}",
      description.media, fmt_list
    ));
    lines.push("c=IN IP4 0.0.0.0".to_owned());

    if let (Some(ufrag), Some(pwd)) = (&transport.ufrag, &transport.pwd) {
      lines.push(format!("a=ice-ufrag:{}", ufrag));
      lines.push(format!("a=ice-pwd:{}", pwd));
    }

    if let Some(fingerprint) = &transport.fingerprint {
      lines.push(format!(
        "a=fingerprint:{} {}",
        String::from(fingerprint.hash.clone()),
        fingerprint_hex(&fingerprint.value)
      ));
      let setup = fingerprint
        .setup
        .as_ref()
        .map(|setup| match setup {
          Setup::Active => "active",
          Setup::Passive => "passive",
          Setup::Actpass => "actpass",
        })
        .unwrap_or("actpass");
      lines.push(format!("a=setup:{}", setup));
    }

    lines.push(format!("a=mid:{}", content.name.0));

    // Jingle senders are phrased from the initiator's perspective.
    lines.push(
      match content.senders.clone().unwrap_or(Senders::Both) {
        Senders::Both => "a=sendrecv",
        Senders::Initiator => "a=recvonly",
        Senders::Responder => "a=sendonly",
        Senders::None => "a=recvonly",
      }
      .to_owned(),
    );

    lines.push("a=rtcp-mux".to_owned());

    for pt in &description.payload_types {
      if codec_excluded(pt.name.as_deref()) {
        continue;
      }
      let name = pt.name.as_deref().unwrap_or_default();
      let clockrate = pt.clockrate.unwrap_or_default();
      if pt.channels.0 > 1 {
        lines.push(format!(
          "a=rtpmap:{} {}/{}/{}",
          pt.id, name, clockrate, pt.channels.0
        ));
      }
      else {
        lines.push(format!("a=rtpmap:{} {}/{}", pt.id, name, clockrate));
      }

      if !pt.parameters.is_empty() {
        let params = pt
          .parameters
          .iter()
          .map(|param| format!("{}={}", param.name, param.value))
          .join(";");
        lines.push(format!("a=fmtp:{} {}", pt.id, params));
      }
    }

    for pt in &description.payload_types {
      if codec_excluded(pt.name.as_deref()) {
        continue;
      }
      for fb in &pt.rtcp_fbs {
        match &fb.subtype {
          Some(subtype) => lines.push(format!("a=rtcp-fb:{} {} {}", pt.id, fb.type_, subtype)),
          None => lines.push(format!("a=rtcp-fb:{} {}", pt.id, fb.type_)),
        }
      }
    }
  }

  lines.join("\r\n") + "\r\n"
}

/// Extract the primary SSRC per media kind from a Jingle offer.
///
/// Simulcast layers beyond the first source are ignored, as is any source
/// whose ssrc does not parse.
pub fn extract_ssrcs(jingle: &Jingle) -> HashMap<MediaType, SsrcDescription> {
  let mut ssrcs = HashMap::new();

  for content in &jingle.contents {
    let description = match &content.description {
      Some(Description::Rtp(description)) => description,
      _ => continue,
    };
    let media_type = match MediaType::from_sdp(&description.media) {
      Some(media_type) => media_type,
      None => continue,
    };

    for source in &description.ssrcs {
      let ssrc = match source.ssrc() {
        Some(ssrc) => ssrc,
        None => continue,
      };
      ssrcs.entry(media_type).or_insert_with(|| SsrcDescription {
        ssrc,
        cname: source.parameter("cname").unwrap_or_default().to_owned(),
        msid: source.parameter("msid").unwrap_or_default().to_owned(),
        mslabel: source.parameter("mslabel").unwrap_or_default().to_owned(),
        label: source.parameter("label").unwrap_or_default().to_owned(),
      });
    }
  }

  ssrcs
}

#[derive(Debug, Default)]
pub(crate) struct SdpFingerprint {
  pub(crate) hash_alg: String,
  pub(crate) setup: String,
  pub(crate) value: String,
}

#[derive(Debug, Default)]
pub(crate) struct SdpPayload {
  pub(crate) name: String,
  pub(crate) clockrate: u32,
  pub(crate) channels: Option<u8>,
  pub(crate) params: Vec<(String, String)>,
  pub(crate) rtcp_fbs: Vec<(String, Option<String>)>,
}

#[derive(Debug)]
pub(crate) struct MediaSection {
  pub(crate) media: String,
  pub(crate) mid: Option<String>,
  pub(crate) payload_order: Vec<u8>,
  pub(crate) payloads: HashMap<u8, SdpPayload>,
  pub(crate) extmaps: Vec<(String, String)>,
  pub(crate) ufrag: String,
  pub(crate) pwd: String,
  pub(crate) fingerprint: SdpFingerprint,
}

static RE_MEDIA: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^m=(audio|video) \d+ [A-Z/]+ (.*)").unwrap());
static RE_MID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^a=mid:(\S+)").unwrap());
static RE_RTPMAP: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^a=rtpmap:(\d+) ([\w\-]+)/(\d+)(?:/(\d+))?").unwrap());
static RE_FMTP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^a=fmtp:(\d+) (.+)").unwrap());
static RE_RTCP_FB: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^a=rtcp-fb:(\d+) ([\w\-]+)(?: ([\w\-]+))?").unwrap());
static RE_EXTMAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^a=extmap:(\d+) (.+)").unwrap());
static RE_UFRAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^a=ice-ufrag:(.+)").unwrap());
static RE_PWD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^a=ice-pwd:(.+)").unwrap());
static RE_FINGERPRINT: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^a=fingerprint:([\w\-]+) (.+)").unwrap());
static RE_SETUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^a=setup:(.+)").unwrap());

pub(crate) fn parse_media_sections(sdp: &str) -> Vec<MediaSection> {
  let mut sections: Vec<MediaSection> = vec![];

  for line in sdp.lines() {
    if let Some(captures) = RE_MEDIA.captures(line) {
      let payload_order: Vec<u8> = captures[2]
        .split_whitespace()
        .filter_map(|pt| pt.parse().ok())
        .collect();
      sections.push(MediaSection {
        media: captures[1].to_owned(),
        mid: None,
        payloads: payload_order
          .iter()
          .map(|pt| (*pt, SdpPayload::default()))
          .collect(),
        payload_order,
        extmaps: vec![],
        ufrag: String::new(),
        pwd: String::new(),
        fingerprint: SdpFingerprint {
          hash_alg: "sha-256".to_owned(),
          setup: "active".to_owned(),
          value: String::new(),
        },
      });
      continue;
    }

    let section = match sections.last_mut() {
      Some(section) => section,
      None => continue,
    };

    if let Some(captures) = RE_MID.captures(line) {
      section.mid = Some(captures[1].to_owned());
    }
    else if let Some(captures) = RE_UFRAG.captures(line) {
      section.ufrag = captures[1].to_owned();
    }
    else if let Some(captures) = RE_PWD.captures(line) {
      section.pwd = captures[1].to_owned();
    }
    else if let Some(captures) = RE_FINGERPRINT.captures(line) {
      section.fingerprint.hash_alg = captures[1].to_owned();
      section.fingerprint.value = captures[2].to_owned();
    }
    else if let Some(captures) = RE_SETUP.captures(line) {
      section.fingerprint.setup = captures[1].to_owned();
    }
    else if let Some(captures) = RE_RTPMAP.captures(line) {
      let pt: u8 = match captures[1].parse() {
        Ok(pt) => pt,
        Err(_) => continue,
      };
      if let Some(payload) = section.payloads.get_mut(&pt) {
        payload.name = captures[2].to_owned();
        payload.clockrate = captures[3].parse().unwrap_or_default();
        payload.channels = captures.get(4).and_then(|c| c.as_str().parse().ok());
      }
    }
    else if let Some(captures) = RE_FMTP.captures(line) {
      let pt: u8 = match captures[1].parse() {
        Ok(pt) => pt,
        Err(_) => continue,
      };
      if let Some(payload) = section.payloads.get_mut(&pt) {
        payload.params = captures[2]
          .split(';')
          .filter_map(|pair| {
            pair
              .split_once('=')
              .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
          })
          .collect();
      }
    }
    else if let Some(captures) = RE_RTCP_FB.captures(line) {
      let pt: u8 = match captures[1].parse() {
        Ok(pt) => pt,
        Err(_) => continue,
      };
      if let Some(payload) = section.payloads.get_mut(&pt) {
        payload.rtcp_fbs.push((
          captures[2].to_owned(),
          captures.get(3).map(|s| s.as_str().to_owned()),
        ));
      }
    }
    else if let Some(captures) = RE_EXTMAP.captures(line) {
      section
        .extmaps
        .push((captures[1].to_owned(), captures[2].to_owned()));
    }
  }

  sections
}

/// Convert a local SDP answer into a Jingle session-accept.
///
/// Carries the full codec description (payload types, fmtp parameters, rtcp-fb
/// and header extensions) because Jicofo rejects bare accepts.
pub fn sdp_to_jingle_accept(
  sdp_answer: &str,
  sid: &str,
  initiator: Jid,
  responder: Jid,
) -> Result<Jingle> {
  let sections = parse_media_sections(sdp_answer);

  let mut jingle = Jingle::new(Action::SessionAccept, SessionId(sid.to_owned()))
    .with_initiator(initiator)
    .with_responder(responder);

  let mut group = Group {
    semantics: Semantics::Bundle,
    contents: vec![],
  };

  for (index, section) in sections.iter().enumerate() {
    let mid = section
      .mid
      .clone()
      .unwrap_or_else(|| index.to_string());
    group.contents.push(jingle_grouping::Content::new(&mid));

    let mut description = RtpDescription::new(section.media.clone());
    for pt_id in &section.payload_order {
      let payload = section
        .payloads
        .get(pt_id)
        .context("payload order refers to an unknown payload type")?;
      let mut payload_type = PayloadType::new(
        *pt_id,
        payload.name.clone(),
        payload.clockrate,
        payload.channels.unwrap_or(1),
      );
      payload_type.parameters = payload
        .params
        .iter()
        .map(|(name, value)| RtpParameter {
          name: name.clone(),
          value: value.clone(),
        })
        .collect();
      payload_type.rtcp_fbs = payload
        .rtcp_fbs
        .iter()
        .map(|(type_, subtype)| RtcpFb {
          type_: type_.clone(),
          subtype: subtype.clone(),
        })
        .collect();
      description.payload_types.push(payload_type);
    }

    for (ext_id, uri) in &section.extmaps {
      description
        .hdrexts
        .push(RtpHdrext::new(ext_id.parse().unwrap_or(0), uri.clone()));
    }

    // The focus offers actpass; the answer must commit to the active role.
    let setup = if section.fingerprint.setup == "actpass" {
      Setup::Active
    }
    else {
      section.fingerprint.setup.parse().unwrap_or(Setup::Active)
    };
    let mut transport = IceUdpTransport::new()
      .with_credentials(section.ufrag.clone(), section.pwd.clone());
    if !section.fingerprint.value.is_empty() {
      transport = transport.with_fingerprint(Fingerprint::from_colon_separated_hex(
        setup,
        &section.fingerprint.hash_alg,
        &section.fingerprint.value,
      )?);
    }

    jingle = jingle.add_content(
      Content::new(Creator::Initiator, ContentId(mid))
        .with_senders(Senders::Both)
        .with_description(description)
        .with_transport(transport),
    );
  }

  jingle = jingle.set_group(group);
  Ok(jingle)
}

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;
  use xmpp_parsers::Element;

  fn sample_offer() -> Jingle {
    let elem: Element = "<jingle xmlns='urn:xmpp:jingle:1' action='session-initiate' sid='s1'
              initiator='focus@auth.example/focus'>
        <content xmlns='urn:xmpp:jingle:1' creator='initiator' name='0' senders='both'>
          <description xmlns='urn:xmpp:jingle:apps:rtp:1' media='audio'>
            <payload-type id='111' name='opus' clockrate='48000' channels='2'>
              <parameter name='minptime' value='10'/>
              <parameter name='useinbandfec' value='1'/>
              <rtcp-fb xmlns='urn:xmpp:jingle:apps:rtp:rtcp-fb:0' type='transport-cc'/>
            </payload-type>
            <payload-type id='126' name='telephone-event' clockrate='8000'/>
            <source xmlns='urn:xmpp:jingle:apps:rtp:ssma:0' ssrc='1234567'>
              <parameter name='cname' value='alice'/>
              <parameter name='msid' value='X Y'/>
            </source>
          </description>
          <transport xmlns='urn:xmpp:jingle:transports:ice-udp:1' ufrag='uf' pwd='pw'>
            <fingerprint xmlns='urn:xmpp:jingle:apps:dtls:0' hash='sha-256' setup='actpass'>0A:1B:2C:3D</fingerprint>
          </transport>
        </content>
        <content xmlns='urn:xmpp:jingle:1' creator='initiator' name='1' senders='initiator'>
          <description xmlns='urn:xmpp:jingle:apps:rtp:1' media='video'>
            <payload-type id='100' name='VP8' clockrate='90000'>
              <rtcp-fb xmlns='urn:xmpp:jingle:apps:rtp:rtcp-fb:0' type='nack' subtype='pli'/>
            </payload-type>
            <payload-type id='96' name='rtx' clockrate='90000'/>
          </description>
          <transport xmlns='urn:xmpp:jingle:transports:ice-udp:1' ufrag='uf' pwd='pw'>
            <fingerprint xmlns='urn:xmpp:jingle:apps:dtls:0' hash='sha-256' setup='actpass'>0A:1B:2C:3D</fingerprint>
          </transport>
        </content>
      </jingle>"
      .parse()
      .unwrap();
    Jingle::try_from(elem).unwrap()
  }

  #[test]
  fn sdp_starts_with_version_and_uses_crlf() {
    let sdp = jingle_to_sdp(&sample_offer());
    assert!(sdp.starts_with("v=0\r\n"));
    assert!(sdp.ends_with("\r\n"));
    for line in sdp.split("\r\n") {
      assert!(!line.contains('\n'));
    }
  }

  #[test]
  fn sdp_carries_bundle_and_codecs() {
    let sdp = jingle_to_sdp(&sample_offer());
    assert!(sdp.contains("a=group:BUNDLE 0 1\r\n"));
    assert!(sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 126\r\n"));
    // rtx is excluded from the format list and rtpmap lines
    assert!(sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 100\r\n"));
    assert!(!sdp.contains("a=rtpmap:96"));
    assert!(sdp.contains("a=rtpmap:111 opus/48000/2\r\n"));
    assert!(sdp.contains("a=fmtp:111 minptime=10;useinbandfec=1\r\n"));
    assert!(sdp.contains("a=rtcp-fb:100 nack pli\r\n"));
    assert!(sdp.contains("a=fingerprint:sha-256 0A:1B:2C:3D\r\n"));
    assert!(sdp.contains("a=setup:actpass\r\n"));
  }

  #[test]
  fn sdp_direction_follows_senders() {
    let sdp = jingle_to_sdp(&sample_offer());
    let audio_start = sdp.find("m=audio").unwrap();
    let video_start = sdp.find("m=video").unwrap();
    assert!(sdp[audio_start..video_start].contains("a=sendrecv\r\n"));
    assert!(sdp[video_start..].contains("a=recvonly\r\n"));
  }

  #[test]
  fn content_without_transport_is_skipped() {
    let elem: Element = "<jingle xmlns='urn:xmpp:jingle:1' action='session-initiate' sid='s2'>
        <content xmlns='urn:xmpp:jingle:1' creator='initiator' name='data'>
          <description xmlns='urn:xmpp:jingle:apps:rtp:1' media='audio'>
            <payload-type id='111' name='opus' clockrate='48000' channels='2'/>
          </description>
        </content>
      </jingle>"
      .parse()
      .unwrap();
    let jingle = Jingle::try_from(elem).unwrap();
    let sdp = jingle_to_sdp(&jingle);
    assert!(sdp.contains("a=group:BUNDLE data\r\n"));
    assert!(!sdp.contains("m=audio"));
  }

  #[test]
  fn extracts_primary_ssrc_with_parameters() {
    let ssrcs = extract_ssrcs(&sample_offer());
    let audio = ssrcs.get(&MediaType::Audio).unwrap();
    assert_eq!(
      audio,
      &SsrcDescription {
        ssrc: 1234567,
        cname: "alice".to_owned(),
        msid: "X Y".to_owned(),
        mslabel: String::new(),
        label: String::new(),
      }
    );
    assert!(!ssrcs.contains_key(&MediaType::Video));
  }

  #[test]
  fn offer_to_accept_round_trip() {
    let offer = sample_offer();
    let sdp = jingle_to_sdp(&offer);
    let accept = sdp_to_jingle_accept(
      &sdp,
      "s1",
      "focus@auth.example/focus".parse().unwrap(),
      "recorder@auth.example/r1".parse().unwrap(),
    )
    .unwrap();

    assert_eq!(accept.action, Action::SessionAccept);
    assert_eq!(accept.sid.0, "s1");

    let mids: Vec<_> = accept
      .contents
      .iter()
      .map(|content| content.name.0.clone())
      .collect();
    assert_eq!(mids, vec!["0".to_owned(), "1".to_owned()]);
    let group = accept.group.as_ref().unwrap();
    assert_eq!(group.semantics, Semantics::Bundle);
    assert_eq!(group.contents.len(), 2);

    match accept.contents[0].description.as_ref().unwrap() {
      Description::Rtp(description) => {
        let ids: Vec<_> = description.payload_types.iter().map(|pt| pt.id).collect();
        assert_eq!(ids, vec![111, 126]);
        assert_eq!(description.payload_types[0].parameters.len(), 2);
      },
      other => panic!("unexpected description: {:?}", other),
    }

    match accept.contents[0].transport.as_ref().unwrap() {
      Transport::IceUdp(transport) => {
        assert_eq!(transport.ufrag.as_deref(), Some("uf"));
        assert_eq!(transport.pwd.as_deref(), Some("pw"));
        // actpass in the offer must become active in the accept
        assert_eq!(
          transport.fingerprint.as_ref().unwrap().setup,
          Some(Setup::Active)
        );
      },
      other => panic!("unexpected transport: {:?}", other),
    }
  }

  #[test]
  fn accept_payload_elements_have_names_and_types() {
    let offer = sample_offer();
    let sdp = jingle_to_sdp(&offer);
    let accept = sdp_to_jingle_accept(
      &sdp,
      "s1",
      "focus@auth.example/focus".parse().unwrap(),
      "recorder@auth.example/r1".parse().unwrap(),
    )
    .unwrap();
    let elem: Element = accept.into();
    for content in elem.children().filter(|c| c.name() == "content") {
      for description in content.children().filter(|c| c.name() == "description") {
        for pt in description.children().filter(|c| c.name() == "payload-type") {
          for child in pt.children() {
            match child.name() {
              "parameter" => assert!(child.attr("name").is_some()),
              "rtcp-fb" => assert!(child.attr("type").is_some()),
              _ => {},
            }
          }
        }
      }
    }
  }
}
