//! A minimal media plane for a participant that never sends media.
//!
//! The recorder answers Jingle offers so that the focus keeps it in the
//! conference, but the actual audio flows through bridge-side forwarders to
//! the capture subprocess. What remains here is the DTLS identity, local ICE
//! credentials, a bound UDP endpoint whose inbound datagrams are drained to a
//! null sink, and the offer/answer bookkeeping.

use std::sync::Arc;

use anyhow::{Context, Result};
use itertools::Itertools;
use pem::Pem;
use rand::{distributions::Alphanumeric, Rng};
use rcgen::{Certificate, CertificateParams, PKCS_ECDSA_P256_SHA256};
use ring::digest::{digest, SHA256};
use tokio::{
  net::UdpSocket,
  sync::{watch, Mutex},
  task::JoinHandle,
  time::Duration,
};
use tracing::{debug, trace, warn};
use xmpp_parsers::jingle_ice_udp::Candidate;

use crate::jingle_sdp::parse_media_sections;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IceGatheringState {
  New,
  Complete,
}

/// One Jingle session's media-plane state, keyed by sid.
pub(crate) struct PeerConnection {
  pub(crate) sid: String,
  ufrag: String,
  pwd: String,
  fingerprint: Vec<u8>,
  remote_sdp: Mutex<Option<String>>,
  local_sdp: Mutex<Option<String>>,
  remote_candidates: Mutex<Vec<Candidate>>,
  gathering_rx: watch::Receiver<IceGatheringState>,
  socket: Arc<UdpSocket>,
  drain_task: JoinHandle<()>,
}

impl PeerConnection {
  pub(crate) async fn new(sid: String) -> Result<Self> {
    let mut dtls_cert_params = CertificateParams::new(vec!["meet-recorder".to_owned()]);
    dtls_cert_params.alg = &PKCS_ECDSA_P256_SHA256;
    let dtls_cert = Certificate::from_params(dtls_cert_params)?;
    let dtls_cert_der = dtls_cert.serialize_der()?;
    let fingerprint = digest(&SHA256, &dtls_cert_der).as_ref().to_vec();
    let dtls_cert_pem = pem::encode(&Pem::new("CERTIFICATE", dtls_cert_der));
    debug!("local DTLS certificate:\n{}", dtls_cert_pem);

    let ufrag: String = rand::thread_rng()
      .sample_iter(&Alphanumeric)
      .take(8)
      .map(char::from)
      .collect();
    let pwd: String = rand::thread_rng()
      .sample_iter(&Alphanumeric)
      .take(22)
      .map(char::from)
      .collect();

    let socket = Arc::new(
      UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind media socket")?,
    );
    debug!("media socket bound on {:?}", socket.local_addr());

    // Null sink: anything the bridge sends us is read and dropped.
    let drain_socket = socket.clone();
    let drain_task = tokio::spawn(async move {
      let mut buf = [0u8; 1500];
      loop {
        match drain_socket.recv_from(&mut buf).await {
          Ok((len, from)) => trace!("drained {} bytes from {}", len, from),
          Err(e) => {
            warn!("media socket read failed: {:?}", e);
            break;
          },
        }
      }
    });

    // A single host candidate from the bound socket; with that the gathering
    // phase has nothing left to wait for.
    let (gathering_tx, gathering_rx) = watch::channel(IceGatheringState::New);
    let _ = gathering_tx.send(IceGatheringState::Complete);

    Ok(Self {
      sid,
      ufrag,
      pwd,
      fingerprint,
      remote_sdp: Mutex::new(None),
      local_sdp: Mutex::new(None),
      remote_candidates: Mutex::new(vec![]),
      gathering_rx,
      socket,
      drain_task,
    })
  }

  pub(crate) fn fingerprint_hex(&self) -> String {
    itertools::join(
      self.fingerprint.iter().map(|byte| format!("{:02X}", byte)),
      ":",
    )
  }

  pub(crate) async fn set_remote_description(&self, sdp: &str) {
    *self.remote_sdp.lock().await = Some(sdp.to_owned());
  }

  pub(crate) async fn set_local_description(&self, sdp: &str) {
    *self.local_sdp.lock().await = Some(sdp.to_owned());
  }

  pub(crate) async fn local_description(&self) -> Option<String> {
    self.local_sdp.lock().await.clone()
  }

  /// Build an SDP answer mirroring the remote offer's media sections with our
  /// credentials and fingerprint, committing to the active DTLS role.
  pub(crate) async fn create_answer(&self) -> Result<String> {
    let remote = self
      .remote_sdp
      .lock()
      .await
      .clone()
      .context("no remote description")?;
    let sections = parse_media_sections(&remote);

    let mut lines: Vec<String> = vec![
      "v=0".to_owned(),
      "o=- 0 0 IN IP4 0.0.0.0".to_owned(),
      "s=-".to_owned(),
      "t=0 0".to_owned(),
    ];
    let mids: Vec<String> = sections
      .iter()
      .enumerate()
      .map(|(index, section)| section.mid.clone().unwrap_or_else(|| index.to_string()))
      .collect();
    if !mids.is_empty() {
      lines.push(format!("a=group:BUNDLE {}", mids.join(" ")));
    }

    for (section, mid) in sections.iter().zip(&mids) {
      let fmt_list = section
        .payload_order
        .iter()
        .map(|pt| pt.to_string())
        .join(" ");
      lines.push(format!("m={} 9 UDP/TLS/RTP/SAVPF {}", section.media, fmt_list));
      lines.push("c=IN IP4 0.0.0.0".to_owned());
      lines.push(format!("a=ice-ufrag:{}", self.ufrag));
      lines.push(format!("a=ice-pwd:{}", self.pwd));
      lines.push(format!("a=fingerprint:sha-256 {}", self.fingerprint_hex()));
      lines.push("a=setup:active".to_owned());
      lines.push(format!("a=mid:{}", mid));
      lines.push("a=recvonly".to_owned());
      lines.push("a=rtcp-mux".to_owned());

      for pt_id in &section.payload_order {
        let payload = match section.payloads.get(pt_id) {
          Some(payload) => payload,
          None => continue,
        };
        match payload.channels {
          Some(channels) if channels > 1 => lines.push(format!(
            "a=rtpmap:{} {}/{}/{}",
            pt_id, payload.name, payload.clockrate, channels
          )),
          _ => lines.push(format!(
            "a=rtpmap:{} {}/{}",
            pt_id, payload.name, payload.clockrate
          )),
        }
        if !payload.params.is_empty() {
          let params = payload
            .params
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .join(";");
          lines.push(format!("a=fmtp:{} {}", pt_id, params));
        }
        for (type_, subtype) in &payload.rtcp_fbs {
          match subtype {
            Some(subtype) => lines.push(format!("a=rtcp-fb:{} {} {}", pt_id, type_, subtype)),
            None => lines.push(format!("a=rtcp-fb:{} {}", pt_id, type_)),
          }
        }
      }
      for (ext_id, uri) in &section.extmaps {
        lines.push(format!("a=extmap:{} {}", ext_id, uri));
      }
    }

    Ok(lines.join("\r\n") + "\r\n")
  }

  /// Record a trickle candidate from a transport-info stanza.
  pub(crate) async fn add_remote_candidate(&self, candidate: Candidate) {
    debug!(
      "adding remote candidate {}:{} ({})",
      candidate.ip, candidate.port, candidate.protocol
    );
    self.remote_candidates.lock().await.push(candidate);
  }

  /// Wait for ICE gathering, proceeding with whatever was gathered when the
  /// deadline expires.
  pub(crate) async fn wait_ice_gathering(&self, timeout: Duration) -> IceGatheringState {
    let mut rx = self.gathering_rx.clone();
    let deadline = tokio::time::timeout(timeout, async {
      loop {
        if *rx.borrow() == IceGatheringState::Complete {
          return;
        }
        if rx.changed().await.is_err() {
          return;
        }
      }
    });
    if deadline.await.is_err() {
      warn!("ICE gathering timed out for sid {}; proceeding with partial candidates", self.sid);
    }
    *self.gathering_rx.borrow()
  }

  pub(crate) fn local_port(&self) -> Option<u16> {
    self.socket.local_addr().ok().map(|addr| addr.port())
  }

  pub(crate) async fn close(&self) {
    self.drain_task.abort();
  }
}

impl Drop for PeerConnection {
  fn drop(&mut self) {
    self.drain_task.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn answer_mirrors_offer_sections() {
    let pc = PeerConnection::new("sid1".to_owned()).await.unwrap();
    pc.set_remote_description(
      "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n\
       m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=ice-ufrag:remoteuf\r\n\
       a=ice-pwd:remotepw\r\na=fingerprint:sha-256 AA:BB\r\na=setup:actpass\r\na=mid:0\r\n\
       a=sendrecv\r\na=rtcp-mux\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10\r\n",
    )
    .await;
    let answer = pc.create_answer().await.unwrap();
    assert!(answer.starts_with("v=0\r\n"));
    assert!(answer.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"));
    assert!(answer.contains("a=setup:active\r\n"));
    assert!(answer.contains("a=rtpmap:111 opus/48000/2\r\n"));
    assert!(answer.contains(&format!("a=ice-ufrag:{}\r\n", pc.ufrag)));
    assert!(!answer.contains("remoteuf"));
    pc.close().await;
  }

  #[tokio::test]
  async fn gathering_completes_immediately() {
    let pc = PeerConnection::new("sid2".to_owned()).await.unwrap();
    let state = pc.wait_ice_gathering(Duration::from_secs(5)).await;
    assert_eq!(state, IceGatheringState::Complete);
    assert!(pc.local_port().is_some());
    pc.close().await;
  }
}
