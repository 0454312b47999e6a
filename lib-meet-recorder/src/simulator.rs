//! In-process forwarder allocation for running without an XMPP deployment.

use tokio::sync::Mutex;

use crate::manifest::ParticipantInput;

const SIM_PORT_BASE: u16 = 50000;
const SIM_SSRC_BASE: u32 = 1_000_000;

#[derive(Debug)]
struct SimulatorState {
  next_port: u16,
  next_ssrc: u32,
}

/// Hands out fake RTP endpoints with the same shape real allocations have.
#[derive(Debug)]
pub struct ColibriSimulator {
  state: Mutex<SimulatorState>,
}

impl Default for ColibriSimulator {
  fn default() -> Self {
    Self {
      state: Mutex::new(SimulatorState {
        next_port: SIM_PORT_BASE,
        next_ssrc: SIM_SSRC_BASE,
      }),
    }
  }
}

impl ColibriSimulator {
  pub async fn allocate_forwarders(
    &self,
    endpoints: &[(String, String)],
  ) -> Vec<ParticipantInput> {
    let mut state = self.state.lock().await;
    endpoints
      .iter()
      .map(|(id, name)| {
        let port = state.next_port;
        // skip a port for RTCP
        state.next_port += 2;
        let ssrc = state.next_ssrc;
        state.next_ssrc += 1;
        ParticipantInput {
          id: id.clone(),
          name: name.clone(),
          jid: None,
          rtp_url: format!("rtp://127.0.0.1:{}", port),
          ssrc: Some(ssrc),
          pt: Some(111),
          forwarder: serde_json::json!({"simulated": true}),
        }
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn ports_and_ssrcs_are_monotonic() {
    let simulator = ColibriSimulator::default();
    let first = simulator
      .allocate_forwarders(&[("a".to_owned(), String::new()), ("b".to_owned(), String::new())])
      .await;
    assert_eq!(first[0].rtp_url, "rtp://127.0.0.1:50000");
    assert_eq!(first[1].rtp_url, "rtp://127.0.0.1:50002");
    assert_eq!(first[0].ssrc, Some(1_000_000));

    let second = simulator
      .allocate_forwarders(&[("c".to_owned(), String::new())])
      .await;
    assert_eq!(second[0].rtp_url, "rtp://127.0.0.1:50004");
    assert_eq!(second[0].ssrc, Some(1_000_002));
  }
}
