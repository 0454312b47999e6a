//! Bridge forwarder allocation over IQ stanzas, in whichever Colibri dialect
//! the bridge advertises.

use std::{convert::TryFrom, time::Duration};

use anyhow::{bail, Context, Result};
use recorder_xmpp_parsers::{colibri, colibri2};
use tracing::{debug, warn};
use xmpp_parsers::{
  iq::{Iq, IqType},
  jingle_ice_udp::Candidate,
  Jid,
};

use crate::{connection::Connection, util::generate_id};

pub(crate) const COLIBRI_IQ_TIMEOUT: Duration = Duration::from_secs(10);

/// When the bridge returns no candidate, captures still need an RTP target.
const DEFAULT_FORWARDER_HOST: &str = "127.0.0.1";
const DEFAULT_FORWARDER_PORT: u16 = 50000;
const OPUS_PAYLOAD_TYPE: u8 = 111;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColibriDialect {
  V1,
  V2,
}

/// What the bridge occupant advertised in its disco#info reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeCapabilities {
  pub supports_colibri_v1: bool,
  pub supports_colibri_v2: bool,
}

impl BridgeCapabilities {
  /// v2 when available, else v1, else allocation is unsupported.
  pub fn dialect(&self) -> Option<ColibriDialect> {
    if self.supports_colibri_v2 {
      Some(ColibriDialect::V2)
    }
    else if self.supports_colibri_v1 {
      Some(ColibriDialect::V1)
    }
    else {
      None
    }
  }
}

/// A bridge-side forwarder allocation for one endpoint.
#[derive(Debug, Clone)]
pub struct Allocation {
  pub endpoint_id: String,
  /// The conference id the bridge replied with (v1 assigns one on create).
  pub conference_id: Option<String>,
  /// The v1 channel id, needed for release.
  pub channel_id: Option<String>,
  pub host: String,
  pub port: u16,
  pub payload_type: u8,
  pub ssrc: Option<u32>,
  pub ufrag: Option<String>,
  pub pwd: Option<String>,
  pub candidates: Vec<Candidate>,
}

impl Allocation {
  pub fn rtp_url(&self) -> String {
    format!("rtp://{}:{}", self.host, self.port)
  }
}

/// Issues allocate/release IQs against a discovered bridge.
pub struct ColibriAllocator {
  connection: Connection,
  bridge_jid: Jid,
  dialect: ColibriDialect,
}

impl ColibriAllocator {
  pub fn new(connection: Connection, bridge_jid: Jid, dialect: ColibriDialect) -> Self {
    Self {
      connection,
      bridge_jid,
      dialect,
    }
  }

  pub fn dialect(&self) -> ColibriDialect {
    self.dialect
  }

  /// Allocate an audio forwarder for the endpoint.
  pub async fn allocate(
    &self,
    conference_id: Option<&str>,
    endpoint_id: &str,
  ) -> Result<Allocation> {
    match self.dialect {
      ColibriDialect::V1 => self.allocate_v1(conference_id, endpoint_id).await,
      ColibriDialect::V2 => {
        let conference_id =
          conference_id.context("colibri2 allocation requires a conference id")?;
        self.allocate_v2(conference_id, endpoint_id).await
      },
    }
  }

  async fn allocate_v1(
    &self,
    conference_id: Option<&str>,
    endpoint_id: &str,
  ) -> Result<Allocation> {
    let request = colibri::Conference::new(conference_id.map(ToOwned::to_owned)).add_content(
      colibri::Content::new("audio".to_owned()).add_channel(
        colibri::Channel::new(180)
          .add_payload_type(colibri::PayloadType::new(
            OPUS_PAYLOAD_TYPE,
            "opus".to_owned(),
            48000,
            2,
          ))
          .with_transport(Default::default()),
      ),
    );

    let iq = Iq::from_set(generate_id(), request).with_to(self.bridge_jid.clone());
    let reply = self
      .connection
      .send_iq_with_timeout(iq, COLIBRI_IQ_TIMEOUT)
      .await
      .context("colibri v1 allocation failed")?;

    let payload = match reply.payload {
      IqType::Result(Some(payload)) => payload,
      other => bail!("unexpected colibri v1 reply payload: {:?}", other),
    };
    let conference = colibri::Conference::try_from(payload)?;
    let channel = conference
      .first_channel()
      .context("colibri v1 reply contains no channel")?;

    let transport = channel.transport.as_ref();
    let candidates = transport
      .map(|t| t.candidates.clone())
      .unwrap_or_default();
    let (host, port) = candidates
      .first()
      .map(|c| (c.ip.to_string(), c.port))
      .unwrap_or_else(|| (DEFAULT_FORWARDER_HOST.to_owned(), DEFAULT_FORWARDER_PORT));

    Ok(Allocation {
      endpoint_id: endpoint_id.to_owned(),
      conference_id: conference.id.clone(),
      channel_id: channel.id.clone(),
      host,
      port,
      payload_type: channel
        .payload_types
        .first()
        .map(|pt| pt.id)
        .unwrap_or(OPUS_PAYLOAD_TYPE),
      ssrc: None,
      ufrag: transport.and_then(|t| t.ufrag.clone()),
      pwd: transport.and_then(|t| t.pwd.clone()),
      candidates,
    })
  }

  async fn allocate_v2(&self, conference_id: &str, endpoint_id: &str) -> Result<Allocation> {
    let request = colibri2::ConferenceModify::new(conference_id.to_owned(), true).add_endpoint(
      colibri2::Endpoint::new(endpoint_id.to_owned())
        .add_media(
          colibri2::Media::new("audio".to_owned()).add_payload_type(
            colibri2::PayloadType::new(OPUS_PAYLOAD_TYPE, "opus".to_owned(), 48000, 2),
          ),
        )
        .with_transport(colibri2::Transport::new()),
    );

    let iq = Iq::from_set(generate_id(), request).with_to(self.bridge_jid.clone());
    let reply = self
      .connection
      .send_iq_with_timeout(iq, COLIBRI_IQ_TIMEOUT)
      .await
      .context("colibri v2 allocation failed")?;

    let payload = match reply.payload {
      IqType::Result(Some(payload)) => payload,
      other => bail!("unexpected colibri v2 reply payload: {:?}", other),
    };
    let modified = colibri2::ConferenceModified::try_from(payload)?;

    let (host, port) = modified
      .first_candidate()
      .map(|c| (c.ip.to_string(), c.port))
      .unwrap_or_else(|| (DEFAULT_FORWARDER_HOST.to_owned(), DEFAULT_FORWARDER_PORT));
    let ssrc = modified.first_source().and_then(|source| source.ssrc());
    let payload_type = modified
      .first_payload_type_id()
      .unwrap_or(OPUS_PAYLOAD_TYPE);

    let transport = modified
      .endpoints
      .first()
      .and_then(|ep| ep.transport.as_ref())
      .and_then(|t| t.ice_udp.as_ref());

    Ok(Allocation {
      endpoint_id: endpoint_id.to_owned(),
      conference_id: Some(conference_id.to_owned()),
      channel_id: None,
      host,
      port,
      payload_type,
      ssrc,
      ufrag: transport.and_then(|t| t.ufrag.clone()),
      pwd: transport.and_then(|t| t.pwd.clone()),
      candidates: transport.map(|t| t.candidates.clone()).unwrap_or_default(),
    })
  }

  /// Best-effort release; failures are logged and swallowed.
  pub async fn release(&self, allocation: &Allocation) {
    let result = match self.dialect {
      ColibriDialect::V1 => self.release_v1(allocation).await,
      ColibriDialect::V2 => self.release_v2(allocation).await,
    };
    match result {
      Ok(()) => debug!("released forwarder for {}", allocation.endpoint_id),
      Err(e) => warn!(
        "failed to release forwarder for {}: {:?}",
        allocation.endpoint_id, e
      ),
    }
  }

  async fn release_v1(&self, allocation: &Allocation) -> Result<()> {
    let channel_id = allocation
      .channel_id
      .clone()
      .context("no channel id to release")?;
    let request = colibri::Conference::new(allocation.conference_id.clone()).add_content(
      colibri::Content::new("audio".to_owned()).add_channel(colibri::Channel::expired(channel_id)),
    );
    let iq = Iq::from_set(generate_id(), request).with_to(self.bridge_jid.clone());
    self
      .connection
      .send_iq_with_timeout(iq, COLIBRI_IQ_TIMEOUT)
      .await?;
    Ok(())
  }

  async fn release_v2(&self, allocation: &Allocation) -> Result<()> {
    let conference_id = allocation
      .conference_id
      .clone()
      .context("no conference id to release")?;
    let request = colibri2::ConferenceModify::new(conference_id, false)
      .add_endpoint(colibri2::Endpoint::expired(allocation.endpoint_id.clone()));
    let iq = Iq::from_set(generate_id(), request).with_to(self.bridge_jid.clone());
    self
      .connection
      .send_iq_with_timeout(iq, COLIBRI_IQ_TIMEOUT)
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dialect_selection_prefers_v2() {
    let both = BridgeCapabilities {
      supports_colibri_v1: true,
      supports_colibri_v2: true,
    };
    assert_eq!(both.dialect(), Some(ColibriDialect::V2));

    let v1_only = BridgeCapabilities {
      supports_colibri_v1: true,
      supports_colibri_v2: false,
    };
    assert_eq!(v1_only.dialect(), Some(ColibriDialect::V1));

    assert_eq!(BridgeCapabilities::default().dialect(), None);
  }
}
