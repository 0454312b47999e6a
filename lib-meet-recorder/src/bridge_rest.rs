//! HTTP clients for the bridge: the debug inventory used as the conference-id
//! resolver of last resort, the multitrack-export PATCH, and the legacy
//! forwarder API.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct DebugConference {
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub meeting_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DebugInventory {
  #[serde(default)]
  conferences: HashMap<String, DebugConference>,
}

/// Client for the bridge's private REST interface.
#[derive(Debug, Clone)]
pub struct BridgeRestClient {
  base_url: String,
  client: reqwest::Client,
}

impl BridgeRestClient {
  pub fn new(base_url: &str) -> Self {
    Self {
      base_url: base_url.trim_end_matches('/').to_owned(),
      client: reqwest::Client::new(),
    }
  }

  /// Scrape `/debug` for the conference matching the room, by full JID or by
  /// short name. Returns the `meeting_id` when present, else the inventory
  /// key. Slow; callers rate-limit this.
  pub async fn resolve_conference_id(
    &self,
    room_short: &str,
    room_full: &str,
  ) -> Result<Option<String>> {
    let url = format!("{}/debug", self.base_url);
    let response = self
      .client
      .get(&url)
      .send()
      .await
      .context("bridge debug endpoint unreachable")?;
    if !response.status().is_success() {
      bail!("bridge debug endpoint returned {}", response.status());
    }
    let inventory: DebugInventory = response
      .json()
      .await
      .context("bridge debug endpoint returned unparseable JSON")?;

    for (id, conference) in &inventory.conferences {
      let name = conference.name.as_deref().unwrap_or_default();
      let short = name.split('@').next().unwrap_or_default();
      if name == room_full || short == room_short {
        let resolved = conference
          .meeting_id
          .clone()
          .unwrap_or_else(|| id.clone());
        debug!(
          "resolved conference id for {} via debug inventory: {}",
          room_short, resolved
        );
        return Ok(Some(resolved));
      }
    }
    Ok(None)
  }

  /// Enable the multitrack export by connecting the bridge to the recorder's
  /// media-json WebSocket sink.
  pub async fn patch_connects(&self, conference_id: &str, ws_url: &str) -> Result<StatusCode> {
    let url = format!("{}/colibri/v2/conferences/{}", self.base_url, conference_id);
    let body = json!({
      "connects": [{
        "url": ws_url,
        "protocol": "mediajson",
        "audio": true,
        "video": false,
      }]
    });
    let response = self
      .client
      .patch(&url)
      .json(&body)
      .send()
      .await
      .context("bridge conferences PATCH failed")?;
    Ok(response.status())
  }

  /// Tear the export connection down again by patching an empty connect set.
  pub async fn patch_disconnect(&self, conference_id: &str) -> Result<StatusCode> {
    let url = format!("{}/colibri/v2/conferences/{}", self.base_url, conference_id);
    let response = self
      .client
      .patch(&url)
      .json(&json!({"connects": []}))
      .send()
      .await
      .context("bridge conferences PATCH failed")?;
    Ok(response.status())
  }
}

/// Legacy HTTP forwarder allocation, for deployments exposing the generic
/// `/forward` API instead of (or in addition to) XMPP Colibri.
#[derive(Debug, Clone)]
pub struct LegacyColibriClient {
  base_url: String,
  client: reqwest::Client,
}

impl LegacyColibriClient {
  pub fn new(base_url: &str) -> Self {
    Self {
      base_url: base_url.trim_end_matches('/').to_owned(),
      client: reqwest::Client::new(),
    }
  }

  pub async fn about(&self) -> Result<serde_json::Value> {
    let url = format!("{}/about", self.base_url);
    let response = self.client.get(&url).send().await?.error_for_status()?;
    Ok(response.json().await?)
  }

  /// Allocate audio forwarders for the endpoints; returns the raw allocation
  /// document (`session_id` plus per-endpoint RTP info).
  pub async fn allocate_audio_forwarders(
    &self,
    room: &str,
    endpoints: &[String],
  ) -> Result<serde_json::Value> {
    let url = format!("{}/forward", self.base_url);
    let payload = json!({
      "conference": room,
      "endpoints": endpoints
        .iter()
        .map(|ep| json!({"id": ep, "media": ["audio"]}))
        .collect::<Vec<_>>(),
    });
    let response = self
      .client
      .post(&url)
      .json(&payload)
      .send()
      .await
      .context("legacy colibri allocation failed")?
      .error_for_status()
      .context("legacy colibri allocation rejected")?;
    Ok(response.json().await?)
  }

  /// Best-effort release of a previous allocation.
  pub async fn release(&self, session_id: &str) {
    let url = format!("{}/forward/{}", self.base_url, session_id);
    match self.client.delete(&url).send().await {
      Ok(response) if response.status().is_success() => {},
      Ok(response) => warn!("legacy colibri release returned {}", response.status()),
      Err(e) => warn!("legacy colibri release failed: {:?}", e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn debug_inventory_prefers_meeting_id() {
    let inventory: DebugInventory = serde_json::from_value(json!({
      "conferences": {
        "UUID": {"name": "r5@muc.example", "meeting_id": "MID"},
        "OTHER": {"name": "q@muc.example"},
      }
    }))
    .unwrap();

    let conference = inventory.conferences.get("UUID").unwrap();
    assert_eq!(conference.meeting_id.as_deref(), Some("MID"));
    let other = inventory.conferences.get("OTHER").unwrap();
    assert!(other.meeting_id.is_none());
  }
}
