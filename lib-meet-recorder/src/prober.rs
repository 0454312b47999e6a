//! Service-discovery probe against a bridge occupant, deciding which Colibri
//! dialect the allocator should speak.

use std::{convert::TryFrom, time::Duration};

use anyhow::{bail, Context, Result};
use recorder_xmpp_parsers::ns::{COLIBRI, COLIBRI2};
use tracing::info;
use xmpp_parsers::{
  disco::{DiscoInfoQuery, DiscoInfoResult},
  iq::{Iq, IqType},
  Jid,
};

use crate::{colibri::BridgeCapabilities, connection::Connection, util::generate_id};

const DISCO_TIMEOUT: Duration = Duration::from_secs(5);

/// Ask the bridge occupant which Colibri versions it supports.
pub async fn probe_bridge(connection: &Connection, bridge_jid: Jid) -> Result<BridgeCapabilities> {
  let iq = Iq::from_get(generate_id(), DiscoInfoQuery { node: None })
    .with_to(bridge_jid.clone())
    .with_from(
      connection
        .jid()
        .await
        .map(Jid::Full)
        .context("not connected (no jid)")?,
    );

  let reply = connection
    .send_iq_with_timeout(iq, DISCO_TIMEOUT)
    .await
    .context("disco#info query to bridge failed")?;

  let payload = match reply.payload {
    IqType::Result(Some(payload)) => payload,
    other => bail!("unexpected disco#info reply payload: {:?}", other),
  };
  let disco = DiscoInfoResult::try_from(payload)?;

  let capabilities = BridgeCapabilities {
    supports_colibri_v1: disco.features.iter().any(|f| f.var == COLIBRI),
    supports_colibri_v2: disco.features.iter().any(|f| f.var == COLIBRI2),
  };
  info!(
    "bridge {} capabilities: colibri_v1={} colibri_v2={}",
    bridge_jid, capabilities.supports_colibri_v1, capabilities.supports_colibri_v2
  );
  Ok(capabilities)
}
