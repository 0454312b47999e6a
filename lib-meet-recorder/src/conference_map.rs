//! The process-wide room ↔ bridge-conference-id mapping.
//!
//! Entries arrive from three places: the `bridge-session` extension on
//! session-initiate, `conference-modify` stanzas observed in flight, and the
//! bridge's debug inventory as a last resort.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::debug;

const WAIT_ATTEMPTS: u32 = 25;
const WAIT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Default)]
pub struct ConferenceIdMap {
  inner: Arc<Mutex<HashMap<String, String>>>,
}

impl ConferenceIdMap {
  /// Cache the conference id under both the short room name and the full MUC
  /// JID, so either key form resolves.
  pub async fn insert(&self, room_short: &str, room_full: &str, conference_id: &str) {
    let mut inner = self.inner.lock().await;
    debug!(
      "conference id for {} / {} is {}",
      room_short, room_full, conference_id
    );
    inner.insert(room_short.to_owned(), conference_id.to_owned());
    inner.insert(room_full.to_owned(), conference_id.to_owned());
  }

  pub async fn get(&self, room: &str) -> Option<String> {
    self.inner.lock().await.get(room).cloned()
  }

  /// Poll for the id to appear, bounded at five seconds.
  pub async fn wait_for(&self, room: &str) -> Option<String> {
    for _ in 0..WAIT_ATTEMPTS {
      if let Some(id) = self.get(room).await {
        return Some(id);
      }
      tokio::time::sleep(WAIT_INTERVAL).await;
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn both_key_forms_resolve() {
    let map = ConferenceIdMap::default();
    map.insert("r3", "r3@muc.example", "M").await;
    assert_eq!(map.get("r3").await.as_deref(), Some("M"));
    assert_eq!(map.get("r3@muc.example").await.as_deref(), Some("M"));
    assert_eq!(map.get("other").await, None);
  }

  #[tokio::test]
  async fn wait_for_sees_concurrent_insert() {
    let map = ConferenceIdMap::default();
    let waiter = map.clone();
    let handle = tokio::spawn(async move { waiter.wait_for("room").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    map.insert("room", "room@muc.example", "C1").await;
    assert_eq!(handle.await.unwrap().as_deref(), Some("C1"));
  }
}
