use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::iso_utc;

/// One RTP input to the capture subprocess, however it was obtained: explicit
/// request body, automatic discovery, or a fresh bridge allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInput {
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub jid: Option<String>,
  pub rtp_url: String,
  #[serde(default)]
  pub ssrc: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pt: Option<u8>,
  #[serde(default, skip_serializing_if = "Value::is_null")]
  pub forwarder: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestParticipant {
  pub id: String,
  pub display_name: String,
  pub audio_file: String,
  pub rtp_url: String,
  pub ssrc: Option<u32>,
  pub forwarder: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
  pub id: String,
  pub room: String,
  pub started_at: String,
  pub participants: Vec<ManifestParticipant>,
  pub output_dir: String,
  pub mix: bool,
  pub colibri_session: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ended_at: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub logs_tail: Option<Vec<String>>,
}

/// Replace runs of characters outside `[A-Za-z0-9_-]` with a single `_` and
/// trim `_` from both ends.
pub fn sanitize_filename(name: &str) -> String {
  let mut out = String::with_capacity(name.len());
  let mut last_was_replacement = false;
  for c in name.chars() {
    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
      out.push(c);
      last_was_replacement = false;
    }
    else if !last_was_replacement {
      out.push('_');
      last_was_replacement = true;
    }
  }
  out.trim_matches('_').to_owned()
}

/// The per-participant Opus filename; a pure function of display name and id.
pub fn audio_filename(display_name: &str, id: &str) -> String {
  let sanitized = sanitize_filename(display_name);
  if sanitized.is_empty() {
    format!("audio-{}.opus", id)
  }
  else {
    format!("audio-{}-{}.opus", sanitized, id)
  }
}

/// Build the session descriptor for a new segment.
pub fn build_manifest(
  room: &str,
  participants: &[ParticipantInput],
  out_dir: &Path,
  rec_id: &str,
  mix: bool,
  colibri_session: Option<String>,
) -> Manifest {
  let entries = participants
    .iter()
    .map(|p| ManifestParticipant {
      id: p.id.clone(),
      display_name: p.name.clone(),
      audio_file: audio_filename(&p.name, &p.id),
      rtp_url: p.rtp_url.clone(),
      ssrc: p.ssrc,
      forwarder: p.forwarder.clone(),
    })
    .collect();

  Manifest {
    id: rec_id.to_owned(),
    room: room.to_owned(),
    started_at: iso_utc(Utc::now()),
    participants: entries,
    output_dir: out_dir.to_string_lossy().into_owned(),
    mix,
    colibri_session,
    ended_at: None,
    logs_tail: None,
  }
}

impl Manifest {
  /// Record the end of the segment, with the capture log tail for debugging.
  pub fn finalize(&mut self, logs_tail: Vec<String>) {
    self.ended_at = Some(iso_utc(Utc::now()));
    self.logs_tail = Some(logs_tail);
  }
}

/// Write the manifest as `manifest.json` in the segment directory.
///
/// Writes to a temporary file and renames over the target, so a reader never
/// observes a half-written manifest. Idempotent.
pub async fn write_manifest(out_dir: &Path, manifest: &Manifest) -> Result<PathBuf> {
  tokio::fs::create_dir_all(out_dir)
    .await
    .context("failed to create segment directory")?;
  let path = out_dir.join("manifest.json");
  let tmp_path = out_dir.join("manifest.json.tmp");
  let json = serde_json::to_vec_pretty(manifest)?;
  tokio::fs::write(&tmp_path, json)
    .await
    .context("failed to write manifest")?;
  tokio::fs::rename(&tmp_path, &path)
    .await
    .context("failed to move manifest into place")?;
  Ok(path)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sanitization_examples() {
    assert_eq!(sanitize_filename("John / Doe "), "John_Doe");
    assert_eq!(sanitize_filename(""), "");
    assert_eq!(sanitize_filename("___"), "");
    assert_eq!(sanitize_filename("a--b_c"), "a--b_c");
    assert_eq!(sanitize_filename("Ünïcode name"), "n_code_name");
  }

  #[test]
  fn filename_determinism() {
    assert_eq!(audio_filename("John / Doe ", "abc12"), "audio-John_Doe-abc12.opus");
    assert_eq!(audio_filename("", "abc12"), "audio-abc12.opus");
    assert_eq!(
      audio_filename("John / Doe ", "abc12"),
      audio_filename("John / Doe ", "abc12")
    );
  }

  #[test]
  fn manifest_shape() {
    let participants = vec![ParticipantInput {
      id: "p1".to_owned(),
      name: "Alice".to_owned(),
      jid: None,
      rtp_url: "rtp://127.0.0.1:50000".to_owned(),
      ssrc: Some(42),
      pt: Some(111),
      forwarder: serde_json::json!({"ip": "127.0.0.1", "port": 50000}),
    }];
    let manifest = build_manifest(
      "room1",
      &participants,
      Path::new("/recordings/ffmpeg/room1/20260801T000000Z"),
      "rec-1",
      false,
      None,
    );
    assert_eq!(manifest.participants[0].audio_file, "audio-Alice-p1.opus");
    assert!(manifest.started_at.ends_with('Z'));
    assert!(manifest.ended_at.is_none());

    let json = serde_json::to_value(&manifest).unwrap();
    assert!(json.get("ended_at").is_none());
    assert!(json.get("colibri_session").unwrap().is_null());
  }

  #[tokio::test]
  async fn write_then_finalize_rewrites_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = build_manifest("room2", &[], dir.path(), "rec-2", true, None);
    let path = write_manifest(dir.path(), &manifest).await.unwrap();
    assert!(path.exists());

    manifest.finalize(vec!["log line".to_owned()]);
    write_manifest(dir.path(), &manifest).await.unwrap();
    let raw = tokio::fs::read_to_string(&path).await.unwrap();
    let parsed: Manifest = serde_json::from_str(&raw).unwrap();
    assert!(parsed.ended_at.is_some());
    assert_eq!(parsed.logs_tail.unwrap(), vec!["log line".to_owned()]);
  }
}
