//! Per-room participant state: presence absorption, SSRC correlation and
//! forwarder bookkeeping.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use xmpp_parsers::{jingle_ice_udp::Candidate, FullJid};

use crate::{
  colibri::Allocation,
  manifest::ParticipantInput,
  source::{MediaType, SsrcDescription},
};

/// The MUC nick the recorder joins conferences under.
pub const RECORDER_NICK: &str = "recorder-bot";

/// Occupants that are infrastructure rather than recordable participants.
const INFRASTRUCTURE_MARKERS: [&str; 2] = ["focus", "jibri"];

/// A bridge-side allocation relaying one participant's audio to a UDP
/// endpoint.
#[derive(Debug, Clone)]
pub struct Forwarder {
  pub host: String,
  pub port: u16,
  /// v1 channel id; v2 has no separate channel identity.
  pub channel_id: Option<String>,
  pub endpoint_id: String,
  pub conference_id: Option<String>,
  pub allocated_at: DateTime<Utc>,
  pub ufrag: Option<String>,
  pub pwd: Option<String>,
  pub candidates: Vec<Candidate>,
  pub payload_type: u8,
  pub ssrc: Option<u32>,
}

impl Forwarder {
  pub fn from_allocation(allocation: &Allocation) -> Self {
    Self {
      host: allocation.host.clone(),
      port: allocation.port,
      channel_id: allocation.channel_id.clone(),
      endpoint_id: allocation.endpoint_id.clone(),
      conference_id: allocation.conference_id.clone(),
      allocated_at: Utc::now(),
      ufrag: allocation.ufrag.clone(),
      pwd: allocation.pwd.clone(),
      candidates: allocation.candidates.clone(),
      payload_type: allocation.payload_type,
      ssrc: allocation.ssrc,
    }
  }

  /// The allocation this forwarder came from, for release requests.
  pub fn as_allocation(&self) -> Allocation {
    Allocation {
      endpoint_id: self.endpoint_id.clone(),
      conference_id: self.conference_id.clone(),
      channel_id: self.channel_id.clone(),
      host: self.host.clone(),
      port: self.port,
      payload_type: self.payload_type,
      ssrc: self.ssrc,
      ufrag: self.ufrag.clone(),
      pwd: self.pwd.clone(),
      candidates: self.candidates.clone(),
    }
  }

  pub fn rtp_url(&self) -> String {
    format!("rtp://{}:{}", self.host, self.port)
  }

  fn to_json(&self) -> serde_json::Value {
    json!({
      "ip": self.host,
      "port": self.port,
      "channel_id": self.channel_id,
      "endpoint_id": self.endpoint_id,
      "allocated_at": self.allocated_at.to_rfc3339(),
      "pt": self.payload_type,
      "ssrc": self.ssrc,
    })
  }
}

#[derive(Debug, Clone)]
pub struct Participant {
  pub jid: Option<FullJid>,
  pub nick: String,
  pub display_name: Option<String>,
  pub stats_id: Option<String>,
  pub audio_muted: bool,
  pub video_muted: bool,
  pub joined_at: DateTime<Utc>,
  pub ssrcs: HashMap<MediaType, SsrcDescription>,
  pub forwarder: Option<Forwarder>,
}

impl Participant {
  pub fn new(nick: String) -> Self {
    Self {
      jid: None,
      nick,
      display_name: None,
      stats_id: None,
      audio_muted: false,
      video_muted: false,
      joined_at: Utc::now(),
      ssrcs: HashMap::new(),
      forwarder: None,
    }
  }

  fn is_infrastructure(&self) -> bool {
    if self.nick == RECORDER_NICK {
      return true;
    }
    let jid = self.jid.as_ref().map(|j| j.to_string()).unwrap_or_default();
    INFRASTRUCTURE_MARKERS
      .iter()
      .any(|marker| jid.contains(marker) || self.nick.contains(marker))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantChange {
  Joined,
  Left,
}

type BoxedResultFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type ChangeCallback =
  Arc<dyn (Fn(String, ParticipantChange, Participant) -> BoxedResultFuture) + Send + Sync>;

struct TrackerInner {
  /// room bare JID → nick → participant
  rooms: HashMap<String, HashMap<String, Participant>>,
  /// room bare JID → nicks in arrival order
  join_order: HashMap<String, Vec<String>>,
  on_change: Option<ChangeCallback>,
}

/// Tracks who is in which conference, keyed by MUC nick.
#[derive(Clone)]
pub struct ParticipantTracker {
  inner: Arc<Mutex<TrackerInner>>,
}

impl Default for ParticipantTracker {
  fn default() -> Self {
    Self {
      inner: Arc::new(Mutex::new(TrackerInner {
        rooms: HashMap::new(),
        join_order: HashMap::new(),
        on_change: None,
      })),
    }
  }
}

impl ParticipantTracker {
  pub async fn set_change_callback(
    &self,
    f: impl (Fn(String, ParticipantChange, Participant) -> BoxedResultFuture) + Send + Sync + 'static,
  ) {
    self.inner.lock().await.on_change = Some(Arc::new(f));
  }

  /// Absorb an available presence. Fires the join hook only on first sight of
  /// the nick; later presences just refresh the fields.
  pub async fn observe_join(&self, room: &str, participant: Participant) {
    let (callback, newly_joined) = {
      let mut inner = self.inner.lock().await;
      let occupants = inner.rooms.entry(room.to_owned()).or_default();
      let newly_joined = !occupants.contains_key(&participant.nick);
      let entry = occupants
        .entry(participant.nick.clone())
        .or_insert_with(|| participant.clone());
      if !newly_joined {
        entry.jid = participant.jid.clone().or_else(|| entry.jid.take());
        entry.display_name = participant
          .display_name
          .clone()
          .or_else(|| entry.display_name.take());
        entry.stats_id = participant
          .stats_id
          .clone()
          .or_else(|| entry.stats_id.take());
        entry.audio_muted = participant.audio_muted;
        entry.video_muted = participant.video_muted;
      }
      if newly_joined {
        inner
          .join_order
          .entry(room.to_owned())
          .or_default()
          .push(participant.nick.clone());
        debug!("participant joined {}: {}", room, participant.nick);
      }
      (inner.on_change.clone(), newly_joined)
    };

    if newly_joined {
      if let Some(f) = callback {
        if let Err(e) = f(room.to_owned(), ParticipantChange::Joined, participant).await {
          warn!("participant-join hook failed: {:?}", e);
        }
      }
    }
  }

  /// Absorb an unavailable presence.
  pub async fn observe_leave(&self, room: &str, nick: &str) -> Option<Participant> {
    let (callback, removed) = {
      let mut inner = self.inner.lock().await;
      let removed = inner
        .rooms
        .get_mut(room)
        .and_then(|occupants| occupants.remove(nick));
      if removed.is_some() {
        if let Some(order) = inner.join_order.get_mut(room) {
          order.retain(|n| n != nick);
        }
        debug!("participant left {}: {}", room, nick);
      }
      (inner.on_change.clone(), removed)
    };

    if let Some(participant) = &removed {
      if let Some(f) = callback {
        if let Err(e) = f(
          room.to_owned(),
          ParticipantChange::Left,
          participant.clone(),
        )
        .await
        {
          warn!("participant-leave hook failed: {:?}", e);
        }
      }
    }
    removed
  }

  /// Bind SSRCs parsed from a session-initiate to a participant.
  ///
  /// The stanza carries no participant identity, so this leans on the focus
  /// sending session-initiate shortly after the matching MUC join: walk the
  /// room in reverse join order and take the first occupant that is not
  /// infrastructure and has no SSRCs yet.
  pub async fn bind_ssrcs(
    &self,
    room: &str,
    ssrcs: HashMap<MediaType, SsrcDescription>,
  ) -> Option<Participant> {
    if ssrcs.is_empty() {
      return None;
    }
    let mut inner = self.inner.lock().await;
    let inner = &mut *inner;
    let occupants = inner.rooms.get_mut(room)?;
    let order = inner.join_order.get(room)?;

    for nick in order.iter().rev() {
      let participant = match occupants.get_mut(nick) {
        Some(participant) => participant,
        None => continue,
      };
      if participant.is_infrastructure() || !participant.ssrcs.is_empty() {
        continue;
      }
      participant.ssrcs = ssrcs;
      debug!(
        "bound ssrcs to {} in {}: {:?}",
        participant.nick, room, participant.ssrcs
      );
      return Some(participant.clone());
    }
    warn!("no unbound participant in {} for incoming ssrcs", room);
    None
  }

  pub async fn set_forwarder(
    &self,
    room: &str,
    nick: &str,
    forwarder: Forwarder,
  ) -> Option<Participant> {
    let mut inner = self.inner.lock().await;
    let participant = inner
      .rooms
      .get_mut(room)
      .and_then(|occupants| occupants.get_mut(nick))?;
    participant.forwarder = Some(forwarder);
    Some(participant.clone())
  }

  /// Re-announce a participant to the change hook, e.g. once a forwarder
  /// makes them recordable.
  pub async fn emit_change(&self, room: &str, change: ParticipantChange, participant: Participant) {
    let callback = self.inner.lock().await.on_change.clone();
    if let Some(f) = callback {
      if let Err(e) = f(room.to_owned(), change, participant).await {
        warn!("participant-change hook failed: {:?}", e);
      }
    }
  }

  pub async fn participants(&self, room: &str) -> Vec<Participant> {
    self
      .inner
      .lock()
      .await
      .rooms
      .get(room)
      .map(|occupants| occupants.values().cloned().collect())
      .unwrap_or_default()
  }

  pub async fn participant_count(&self, room: &str) -> usize {
    self
      .inner
      .lock()
      .await
      .rooms
      .get(room)
      .map(|occupants| occupants.len())
      .unwrap_or(0)
  }

  pub async fn forget_room(&self, room: &str) {
    let mut inner = self.inner.lock().await;
    inner.rooms.remove(room);
    inner.join_order.remove(room);
  }

  /// The subset ready to record: an audio SSRC and a forwarder, shaped as the
  /// capture input contract.
  pub async fn participants_with_forwarders(&self, room: &str) -> Vec<ParticipantInput> {
    let inner = self.inner.lock().await;
    let occupants = match inner.rooms.get(room) {
      Some(occupants) => occupants,
      None => return vec![],
    };
    let order = inner.join_order.get(room);

    let ordered: Vec<&Participant> = match order {
      Some(order) => order.iter().filter_map(|nick| occupants.get(nick)).collect(),
      None => occupants.values().collect(),
    };

    ordered
      .into_iter()
      .filter_map(|participant| {
        let forwarder = participant.forwarder.as_ref()?;
        let audio_ssrc = participant.ssrcs.get(&MediaType::Audio)?.ssrc;
        Some(ParticipantInput {
          id: participant.nick.clone(),
          name: participant.display_name.clone().unwrap_or_default(),
          jid: participant.jid.as_ref().map(|jid| jid.to_string()),
          rtp_url: forwarder.rtp_url(),
          ssrc: Some(audio_ssrc),
          pt: Some(forwarder.payload_type),
          forwarder: forwarder.to_json(),
        })
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn participant(nick: &str, jid: &str) -> Participant {
    let mut p = Participant::new(nick.to_owned());
    p.jid = Some(jid.parse().unwrap());
    p
  }

  fn audio_ssrcs(ssrc: u32) -> HashMap<MediaType, SsrcDescription> {
    let mut ssrcs = HashMap::new();
    ssrcs.insert(
      MediaType::Audio,
      SsrcDescription {
        ssrc,
        ..Default::default()
      },
    );
    ssrcs
  }

  #[tokio::test]
  async fn join_then_leave_removes_entry() {
    let tracker = ParticipantTracker::default();
    tracker
      .observe_join("r@muc", participant("alice", "room@muc.example/alice"))
      .await;
    assert_eq!(tracker.participant_count("r@muc").await, 1);
    tracker.observe_leave("r@muc", "alice").await;
    assert_eq!(tracker.participant_count("r@muc").await, 0);
  }

  #[tokio::test]
  async fn binds_most_recent_unbound_participant() {
    let tracker = ParticipantTracker::default();
    tracker
      .observe_join("r@muc", participant("alice", "am9l@meet.example/abc"))
      .await;
    tracker
      .observe_join("r@muc", participant("bob", "Ym9i@meet.example/def"))
      .await;

    // Reverse join order: bob joined last, so the first offer binds to bob.
    let bound = tracker.bind_ssrcs("r@muc", audio_ssrcs(111)).await.unwrap();
    assert_eq!(bound.nick, "bob");

    let bound = tracker.bind_ssrcs("r@muc", audio_ssrcs(222)).await.unwrap();
    assert_eq!(bound.nick, "alice");

    // Everyone is bound now.
    assert!(tracker.bind_ssrcs("r@muc", audio_ssrcs(333)).await.is_none());
  }

  #[tokio::test]
  async fn binding_skips_focus_jibri_and_self() {
    let tracker = ParticipantTracker::default();
    tracker
      .observe_join("r@muc", participant("alice", "am9l@meet.example/abc"))
      .await;
    tracker
      .observe_join("r@muc", participant("focus", "focus@auth.meet.example/focus"))
      .await;
    tracker
      .observe_join("r@muc", participant("jibri-1", "jibri@auth.meet.example/jibri"))
      .await;
    tracker
      .observe_join("r@muc", Participant::new(RECORDER_NICK.to_owned()))
      .await;

    let bound = tracker.bind_ssrcs("r@muc", audio_ssrcs(444)).await.unwrap();
    assert_eq!(bound.nick, "alice");
  }

  #[tokio::test]
  async fn forwarder_subset_shape() {
    let tracker = ParticipantTracker::default();
    let mut alice = participant("alice", "am9l@meet.example/abc");
    alice.display_name = Some("Alice".to_owned());
    tracker.observe_join("r@muc", alice).await;
    tracker
      .observe_join("r@muc", participant("bob", "Ym9i@meet.example/def"))
      .await;

    // bob binds first (reverse join order) but only alice gets a forwarder
    tracker.bind_ssrcs("r@muc", audio_ssrcs(999)).await.unwrap();
    let bound = tracker.bind_ssrcs("r@muc", audio_ssrcs(555)).await.unwrap();
    assert_eq!(bound.nick, "alice");
    let updated = tracker
      .set_forwarder(
        "r@muc",
        "alice",
        Forwarder {
          host: "10.0.0.5".to_owned(),
          port: 50010,
          channel_id: None,
          endpoint_id: "alice".to_owned(),
          conference_id: None,
          allocated_at: Utc::now(),
          ufrag: None,
          pwd: None,
          candidates: vec![],
          payload_type: 111,
          ssrc: None,
        },
      )
      .await;
    assert!(updated.is_some());

    let ready = tracker.participants_with_forwarders("r@muc").await;
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, "alice");
    assert_eq!(ready[0].name, "Alice");
    assert_eq!(ready[0].rtp_url, "rtp://10.0.0.5:50010");
    assert_eq!(ready[0].ssrc, Some(555));
  }

  #[tokio::test]
  async fn change_callback_fires_for_join_and_leave() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let joins = Arc::new(AtomicUsize::new(0));
    let leaves = Arc::new(AtomicUsize::new(0));
    let tracker = ParticipantTracker::default();
    {
      let joins = joins.clone();
      let leaves = leaves.clone();
      tracker
        .set_change_callback(move |_room, change, _participant| {
          let joins = joins.clone();
          let leaves = leaves.clone();
          Box::pin(async move {
            match change {
              ParticipantChange::Joined => joins.fetch_add(1, Ordering::SeqCst),
              ParticipantChange::Left => leaves.fetch_add(1, Ordering::SeqCst),
            };
            Ok(())
          })
        })
        .await;
    }

    tracker
      .observe_join("r@muc", participant("alice", "am9l@meet.example/abc"))
      .await;
    // second presence from the same nick is a refresh, not a join
    tracker
      .observe_join("r@muc", participant("alice", "am9l@meet.example/abc"))
      .await;
    tracker.observe_leave("r@muc", "alice").await;

    assert_eq!(joins.load(Ordering::SeqCst), 1);
    assert_eq!(leaves.load(Ordering::SeqCst), 1);
  }
}
