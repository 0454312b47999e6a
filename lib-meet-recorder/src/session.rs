//! The recorder's XMPP session: brewery-MUC bridge discovery, per-conference
//! MUC lifecycles, and the Jingle/Colibri stanza handlers.

use std::{collections::HashMap, convert::TryFrom, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use recorder_xmpp_parsers::{
  jingle::{Action, Jingle, Transport},
  ns as jitsi_ns,
};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};
use xmpp_parsers::{
  disco::{DiscoInfoQuery, DiscoInfoResult, Feature, Identity},
  iq::{Iq, IqType},
  muc::{user::Status as MucStatus, Muc, MucUser},
  nick::Nick,
  ns,
  presence::{self, Presence},
  BareJid, Element, FullJid, Jid,
};

use crate::{
  bridge_rest::BridgeRestClient,
  colibri::{Allocation, BridgeCapabilities, ColibriAllocator},
  conference_map::ConferenceIdMap,
  connection::{Connection, StanzaHandler},
  jingle_sdp,
  media::PeerConnection,
  participant::{Participant, ParticipantChange, ParticipantTracker, RECORDER_NICK},
  prober::probe_bridge,
  source::MediaType,
  util::generate_id,
};

const MUC_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const BRIDGE_ID_POLL_ATTEMPTS: u32 = 5;
const BRIDGE_ID_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Jibri's feature var; advertising it tells the focus this occupant is a
/// recorder, so no bridge endpoint is allocated for it.
const RECORDER_FEATURE: &str = "http://jitsi.org/protocol/jibri";

static DISCO_INFO: Lazy<DiscoInfoResult> = Lazy::new(|| DiscoInfoResult {
  node: None,
  identities: vec![Identity::new("client", "bot", "en", "meet-recorder")],
  features: vec![
    Feature::new(ns::DISCO_INFO),
    Feature::new(ns::JINGLE),
    Feature::new(ns::JINGLE_RTP),
    Feature::new(ns::JINGLE_RTP_AUDIO),
    Feature::new(ns::JINGLE_RTP_VIDEO),
    Feature::new(ns::JINGLE_ICE_UDP),
    Feature::new(ns::JINGLE_DTLS),
    Feature::new(RECORDER_FEATURE),
  ],
  extensions: vec![],
});

#[derive(Debug, Clone)]
pub struct RecorderSessionConfig {
  pub domain: String,
  pub muc_domain: String,
  pub brewery_muc: BareJid,
  pub brewery_nick: String,
  pub jvb_rest_url: String,
  pub recorder_ws_url: String,
}

struct RoomState {
  joined: bool,
  join_notify: Arc<Notify>,
}

struct SessionInner {
  brewery_joined: bool,
  bridge_jid: Option<Jid>,
  capabilities: Option<BridgeCapabilities>,
  /// room bare JID → state
  joined_rooms: HashMap<String, RoomState>,
  /// Jingle sid → media plane
  peer_connections: HashMap<String, Arc<PeerConnection>>,
  ready_tx: watch::Sender<bool>,
}

/// The silent-participant session. One per process; owns bridge discovery and
/// every conference the recorder sits in.
#[derive(Clone)]
pub struct RecorderSession {
  connection: Connection,
  config: RecorderSessionConfig,
  jid: FullJid,
  pub tracker: ParticipantTracker,
  pub conference_ids: ConferenceIdMap,
  rest: BridgeRestClient,
  inner: Arc<Mutex<SessionInner>>,
  ready_rx: watch::Receiver<bool>,
}

impl RecorderSession {
  /// Register the session on a connected stream and join the brewery MUC.
  pub async fn start(connection: Connection, config: RecorderSessionConfig) -> Result<Self> {
    let jid = connection.jid().await.context("not connected (no jid)")?;
    let (ready_tx, ready_rx) = watch::channel(false);

    let session = Self {
      rest: BridgeRestClient::new(&config.jvb_rest_url),
      connection: connection.clone(),
      config,
      jid,
      tracker: ParticipantTracker::default(),
      conference_ids: ConferenceIdMap::default(),
      inner: Arc::new(Mutex::new(SessionInner {
        brewery_joined: false,
        bridge_jid: None,
        capabilities: None,
        joined_rooms: HashMap::new(),
        peer_connections: HashMap::new(),
        ready_tx,
      })),
      ready_rx,
    };

    connection.add_stanza_handler(session.clone()).await;

    let brewery_jid = session
      .config
      .brewery_muc
      .clone()
      .with_resource(session.config.brewery_nick.clone());
    info!("joining brewery MUC {}", brewery_jid);
    let mut presence = Presence::new(presence::Type::None).with_to(Jid::Full(brewery_jid));
    presence.payloads = vec![Muc::new().into()];
    connection.send_stanza(presence.into()).await?;

    Ok(session)
  }

  pub fn ready(&self) -> bool {
    *self.ready_rx.borrow()
  }

  /// Wait for the ready condition: brewery join acknowledged and a bridge
  /// occupant observed.
  pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
    let mut rx = self.ready_rx.clone();
    tokio::time::timeout(timeout, async {
      loop {
        if *rx.borrow() {
          return Ok::<_, anyhow::Error>(());
        }
        rx.changed().await?;
      }
    })
    .await
    .context("recorder session not ready in time")??;
    Ok(())
  }

  pub async fn bridge_jid(&self) -> Option<Jid> {
    self.inner.lock().await.bridge_jid.clone()
  }

  pub fn brewery_muc(&self) -> &BareJid {
    &self.config.brewery_muc
  }

  fn room_bare_jid(&self, room: &str) -> Result<BareJid> {
    if room.contains('@') {
      room.parse().context("invalid room JID")
    }
    else {
      format!("{}@{}", room, self.config.muc_domain)
        .parse()
        .context("invalid room JID")
    }
  }

  fn short_name(room: &str) -> &str {
    room.split('@').next().unwrap_or(room)
  }

  pub async fn is_in_conference(&self, room: &str) -> bool {
    let bare = match self.room_bare_jid(room) {
      Ok(bare) => bare.to_string(),
      Err(_) => return false,
    };
    self
      .inner
      .lock()
      .await
      .joined_rooms
      .get(&bare)
      .map(|state| state.joined)
      .unwrap_or(false)
  }

  /// Join a conference MUC as the silent recorder.
  ///
  /// The join presence and the muted-flags presence go out back-to-back; the
  /// muted flags plus the recorder feature keep the focus from allocating a
  /// bridge endpoint for the bot itself.
  pub async fn join_conference_muc(&self, room: &str) -> Result<()> {
    let bare = self.room_bare_jid(room)?;
    let occupant_jid = bare.clone().with_resource(RECORDER_NICK.to_owned());
    let join_notify = Arc::new(Notify::new());

    {
      let mut inner = self.inner.lock().await;
      inner.joined_rooms.insert(
        bare.to_string(),
        RoomState {
          joined: false,
          join_notify: join_notify.clone(),
        },
      );
    }

    info!("joining conference MUC {}", occupant_jid);
    let mut join = Presence::new(presence::Type::None).with_to(Jid::Full(occupant_jid.clone()));
    join.payloads = vec![
      Muc::new().into(),
      Feature::new(RECORDER_FEATURE).into(),
    ];
    self.connection.send_stanza(join.into()).await?;

    let mut muted = Presence::new(presence::Type::None).with_to(Jid::Full(occupant_jid));
    muted.payloads = vec![
      Element::builder(
        MediaType::Audio.jitsi_muted_presence_element_name(),
        jitsi_ns::JITSI_MEET_AUDIO,
      )
      .append("true")
      .build(),
      Element::builder(
        MediaType::Video.jitsi_muted_presence_element_name(),
        jitsi_ns::JITSI_MEET_VIDEO,
      )
      .append("true")
      .build(),
    ];
    self.connection.send_stanza(muted.into()).await?;

    tokio::time::timeout(MUC_JOIN_TIMEOUT, join_notify.notified())
      .await
      .context("conference MUC join timed out")?;
    Ok(())
  }

  pub async fn leave_conference_muc(&self, room: &str) -> Result<()> {
    let bare = self.room_bare_jid(room)?;
    self.release_room_forwarders(&bare.to_string()).await;

    let occupant_jid = bare.clone().with_resource(RECORDER_NICK.to_owned());
    let leave = Presence::new(presence::Type::Unavailable).with_to(Jid::Full(occupant_jid));
    self.connection.send_stanza(leave.into()).await?;

    self.inner.lock().await.joined_rooms.remove(&bare.to_string());
    self.tracker.forget_room(&bare.to_string()).await;
    Ok(())
  }

  /// Release every forwarder held for a room; best-effort.
  ///
  /// The IQs go out on detached tasks: release can be reached from the
  /// stanza-handler path, which must never wait for its own replies.
  pub async fn release_room_forwarders(&self, room: &str) {
    let room_bare = match self.room_bare_jid(room) {
      Ok(bare) => bare.to_string(),
      Err(e) => {
        warn!("cannot release forwarders for {}: {:?}", room, e);
        return;
      },
    };
    for participant in self.tracker.participants(&room_bare).await {
      if let Some(forwarder) = &participant.forwarder {
        self.release_forwarder(&forwarder.as_allocation()).await;
      }
    }
  }

  /// Best-effort forwarder release for one endpoint; detached for the same
  /// reason as above.
  pub async fn release_forwarder(&self, allocation: &Allocation) {
    match self.allocator().await {
      Ok(allocator) => {
        let allocation = allocation.clone();
        tokio::spawn(async move {
          allocator.release(&allocation).await;
        });
      },
      Err(e) => warn!("cannot release forwarder: {:?}", e),
    }
  }

  async fn allocator(&self) -> Result<ColibriAllocator> {
    let inner = self.inner.lock().await;
    let bridge_jid = inner
      .bridge_jid
      .clone()
      .context("no bridge discovered yet")?;
    let capabilities = inner
      .capabilities
      .context("bridge capabilities not probed yet")?;
    let dialect = capabilities
      .dialect()
      .context("bridge advertises neither Colibri version")?;
    Ok(ColibriAllocator::new(
      self.connection.clone(),
      bridge_jid,
      dialect,
    ))
  }

  /// Allocate an audio forwarder for one endpoint of a room.
  ///
  /// Waits briefly for the room's bridge conference id to appear in the map,
  /// then falls back to the MUC short name.
  pub async fn allocate_forwarder(&self, room: &str, endpoint_id: &str) -> Result<Allocation> {
    if !self.ready() {
      bail!("recorder session not ready");
    }
    let allocator = self.allocator().await?;
    let short = Self::short_name(room).to_owned();
    let conference_id = match self.conference_ids.wait_for(&short).await {
      Some(id) => id,
      None => {
        debug!(
          "no bridge conference id for {}; falling back to the room name",
          short
        );
        short
      },
    };
    allocator.allocate(Some(&conference_id), endpoint_id).await
  }

  pub async fn get_participants_with_forwarders(
    &self,
    room: &str,
  ) -> Vec<crate::manifest::ParticipantInput> {
    match self.room_bare_jid(room) {
      Ok(bare) => {
        self
          .tracker
          .participants_with_forwarders(&bare.to_string())
          .await
      },
      Err(_) => vec![],
    }
  }

  /// Resolve the bridge conference id for the multitrack path: cache, then a
  /// bounded poll, then the debug inventory.
  async fn resolve_bridge_conference_id(&self, full_room_jid: &str) -> Result<Option<String>> {
    let short = Self::short_name(full_room_jid);

    if let Some(id) = self.conference_ids.get(full_room_jid).await {
      return Ok(Some(id));
    }
    for _ in 0..BRIDGE_ID_POLL_ATTEMPTS {
      tokio::time::sleep(BRIDGE_ID_POLL_INTERVAL).await;
      if let Some(id) = self.conference_ids.get(full_room_jid).await {
        return Ok(Some(id));
      }
    }

    let resolved = self.rest.resolve_conference_id(short, full_room_jid).await?;
    if let Some(id) = &resolved {
      self.conference_ids.insert(short, full_room_jid, id).await;
    }
    Ok(resolved)
  }

  /// Enable the bridge's multitrack export for a conference.
  pub async fn start_multitrack_recording(&self, full_room_jid: &str) -> Result<()> {
    let conference_id = self
      .resolve_bridge_conference_id(full_room_jid)
      .await?
      .with_context(|| format!("no bridge conference found for {}", full_room_jid))?;

    let status = self
      .rest
      .patch_connects(&conference_id, &self.config.recorder_ws_url)
      .await?;
    if status.is_success() {
      return Ok(());
    }
    if status.as_u16() == 404 {
      // Stale cache entry: the conference may have moved; re-resolve once.
      let short = Self::short_name(full_room_jid);
      let fresh = self
        .rest
        .resolve_conference_id(short, full_room_jid)
        .await?
        .with_context(|| format!("conference for {} vanished from the bridge", full_room_jid))?;
      self.conference_ids.insert(short, full_room_jid, &fresh).await;
      let retry = self
        .rest
        .patch_connects(&fresh, &self.config.recorder_ws_url)
        .await?;
      if retry.is_success() {
        return Ok(());
      }
      bail!("multitrack PATCH failed after re-resolution: {}", retry);
    }
    bail!("multitrack PATCH failed: {}", status);
  }

  /// Disable the multitrack export; best-effort.
  pub async fn stop_multitrack_recording(&self, full_room_jid: &str) -> Result<()> {
    if let Some(conference_id) = self.conference_ids.get(full_room_jid).await {
      let status = self.rest.patch_disconnect(&conference_id).await?;
      if !status.is_success() {
        warn!("multitrack disconnect returned {}", status);
      }
    }
    Ok(())
  }

  fn update_ready(inner: &mut SessionInner) {
    let ready = inner.brewery_joined && inner.bridge_jid.is_some();
    let _ = inner.ready_tx.send(ready);
  }

  async fn handle_brewery_presence(&self, presence: Presence, from: FullJid) -> Result<()> {
    let muc_user = presence
      .payloads
      .iter()
      .find(|payload| payload.is("x", ns::MUC_USER))
      .cloned()
      .map(MucUser::try_from)
      .transpose()?;

    let Some(muc_user) = muc_user
    else {
      return Ok(());
    };

    if muc_user.status.contains(&MucStatus::SelfPresence) {
      debug!("joined brewery MUC {}", self.config.brewery_muc);
      let mut inner = self.inner.lock().await;
      inner.brewery_joined = true;
      Self::update_ready(&mut inner);
      return Ok(());
    }

    if presence.type_ == presence::Type::Unavailable {
      return Ok(());
    }

    // A bridge announces itself with a real JID whose local-part is jvb.
    let occupant_real_jid = muc_user.items.iter().find_map(|item| item.jid.clone());
    let is_bridge = occupant_real_jid
      .as_ref()
      .map(|jid| jid.node.as_deref() == Some("jvb"))
      .unwrap_or_else(|| from.resource.starts_with("jvb"));
    if !is_bridge {
      return Ok(());
    }

    let bridge_jid = occupant_real_jid
      .map(Jid::Full)
      .unwrap_or_else(|| Jid::Full(from.clone()));
    info!("discovered bridge {}", bridge_jid);

    let newly_discovered = {
      let mut inner = self.inner.lock().await;
      let newly_discovered = inner.bridge_jid.as_ref() != Some(&bridge_jid);
      inner.bridge_jid = Some(bridge_jid.clone());
      Self::update_ready(&mut inner);
      newly_discovered
    };

    if newly_discovered {
      let session = self.clone();
      tokio::spawn(async move {
        match probe_bridge(&session.connection, bridge_jid).await {
          Ok(capabilities) => {
            session.inner.lock().await.capabilities = Some(capabilities);
          },
          Err(e) => warn!("bridge capability probe failed: {:?}", e),
        }
      });
    }
    Ok(())
  }

  async fn handle_room_presence(&self, presence: Presence, from: FullJid) -> Result<()> {
    let room_bare = BareJid::from(from.clone()).to_string();
    let nick = from.resource.clone();

    if nick == RECORDER_NICK {
      let muc_user = presence
        .payloads
        .iter()
        .find(|payload| payload.is("x", ns::MUC_USER))
        .cloned()
        .map(MucUser::try_from)
        .transpose()?;
      if muc_user
        .map(|muc_user| muc_user.status.contains(&MucStatus::SelfPresence))
        .unwrap_or(true)
      {
        let mut inner = self.inner.lock().await;
        if let Some(room) = inner.joined_rooms.get_mut(&room_bare) {
          if !room.joined {
            debug!("conference MUC join acknowledged: {}", room_bare);
            room.joined = true;
            room.join_notify.notify_waiters();
          }
        }
      }
      return Ok(());
    }

    if presence.type_ == presence::Type::Unavailable {
      self.tracker.observe_leave(&room_bare, &nick).await;
      return Ok(());
    }

    let mut participant = Participant::new(nick);
    for payload in &presence.payloads {
      match payload.name() {
        "x" if payload.is("x", ns::MUC_USER) => {
          let muc_user = MucUser::try_from(payload.clone())?;
          participant.jid = muc_user.items.into_iter().find_map(|item| item.jid);
        },
        "nick" if payload.is("nick", ns::NICK) => {
          participant.display_name = Some(Nick::try_from(payload.clone())?.0);
        },
        "stats-id" => {
          participant.stats_id = Some(payload.text());
        },
        "audiomuted" => {
          participant.audio_muted = payload.text().trim() == "true";
        },
        "videomuted" => {
          participant.video_muted = payload.text().trim() == "true";
        },
        _ => {},
      }
    }

    self.tracker.observe_join(&room_bare, participant).await;
    Ok(())
  }

  async fn ack_iq(&self, to: Jid, id: String) -> Result<()> {
    let result_iq = Iq::empty_result(to, id).with_from(Jid::Full(self.jid.clone()));
    self.connection.send_stanza(result_iq.into()).await
  }

  /// Answer a Jingle offer: ack, cache the bridge-session id, bind SSRCs,
  /// run the offer through the media plane, and send session-accept once ICE
  /// gathering has completed or timed out.
  async fn handle_session_initiate(&self, iq_id: String, from: FullJid, jingle: Jingle) -> Result<()> {
    self.ack_iq(Jid::Full(from.clone()), iq_id).await?;

    let room_bare = BareJid::from(from.clone()).to_string();
    let room_short = Self::short_name(&room_bare).to_owned();
    let sid = jingle.sid.0.clone();
    info!("received Jingle session-initiate for {} (sid {})", room_bare, sid);

    if let Some(bridge_session) = &jingle.bridge_session {
      self
        .conference_ids
        .insert(&room_short, &room_bare, &bridge_session.id)
        .await;
    }

    let initiator = jingle
      .initiator
      .clone()
      .unwrap_or_else(|| Jid::Full(from.clone()));

    // Correlate the offer's SSRCs with a participant, then get a forwarder
    // for them in the background.
    let ssrcs = jingle_sdp::extract_ssrcs(&jingle);
    if let Some(bound) = self.tracker.bind_ssrcs(&room_bare, ssrcs).await {
      let session = self.clone();
      let room_bare_for_alloc = room_bare.clone();
      tokio::spawn(async move {
        session
          .allocate_forwarder_for_participant(&room_bare_for_alloc, &bound)
          .await;
      });
    }

    let sdp_offer = jingle_sdp::jingle_to_sdp(&jingle);
    let pc = Arc::new(PeerConnection::new(sid.clone()).await?);
    pc.set_remote_description(&sdp_offer).await;
    let answer = pc.create_answer().await?;
    pc.set_local_description(&answer).await;
    pc.wait_ice_gathering(ICE_GATHERING_TIMEOUT).await;
    let local_sdp = pc
      .local_description()
      .await
      .context("no local description after answer")?;

    self
      .inner
      .lock()
      .await
      .peer_connections
      .insert(sid.clone(), pc);

    let accept = jingle_sdp::sdp_to_jingle_accept(
      &local_sdp,
      &sid,
      initiator.clone(),
      Jid::Full(self.jid.clone()),
    )?;
    let accept_iq = Iq::from_set(generate_id(), accept)
      .with_to(Jid::Full(from))
      .with_from(Jid::Full(self.jid.clone()));

    let connection = self.connection.clone();
    tokio::spawn(async move {
      match connection
        .send_iq_with_timeout(accept_iq, ACCEPT_ACK_TIMEOUT)
        .await
      {
        Ok(_) => debug!("focus acknowledged session-accept for sid {}", sid),
        Err(e) => warn!("session-accept for sid {} not acknowledged: {:?}", sid, e),
      }
    });
    Ok(())
  }

  async fn allocate_forwarder_for_participant(&self, room_bare: &str, participant: &Participant) {
    match self.allocate_forwarder(room_bare, &participant.nick).await {
      Ok(allocation) => {
        info!(
          "allocated forwarder for {} in {}: {}",
          participant.nick,
          room_bare,
          allocation.rtp_url()
        );
        let mut forwarder = crate::participant::Forwarder::from_allocation(&allocation);
        if forwarder.ssrc.is_none() {
          forwarder.ssrc = participant.ssrcs.get(&MediaType::Audio).map(|s| s.ssrc);
        }
        if let Some(updated) = self
          .tracker
          .set_forwarder(room_bare, &participant.nick, forwarder)
          .await
        {
          // Now recordable: let the rotation hook see the updated set.
          self
            .tracker
            .emit_change(room_bare, ParticipantChange::Joined, updated)
            .await;
        }
      },
      Err(e) => warn!(
        "forwarder allocation for {} in {} failed: {:?}",
        participant.nick, room_bare, e
      ),
    }
  }

  async fn handle_transport_info(&self, iq_id: String, from: FullJid, jingle: Jingle) -> Result<()> {
    let pc = self
      .inner
      .lock()
      .await
      .peer_connections
      .get(&jingle.sid.0)
      .cloned();

    if let Some(pc) = pc {
      for content in &jingle.contents {
        if let Some(Transport::IceUdp(transport)) = &content.transport {
          for candidate in &transport.candidates {
            pc.add_remote_candidate(candidate.clone()).await;
          }
        }
      }
    }
    else {
      debug!("transport-info for unknown sid {}", jingle.sid.0);
    }

    self.ack_iq(Jid::Full(from), iq_id).await
  }

  async fn handle_session_terminate(&self, iq_id: String, from: FullJid, jingle: Jingle) -> Result<()> {
    self.ack_iq(Jid::Full(from), iq_id).await?;
    if let Some(pc) = self
      .inner
      .lock()
      .await
      .peer_connections
      .remove(&jingle.sid.0)
    {
      pc.close().await;
    }
    Ok(())
  }

  /// Always ack conference-modify, then absorb the id mapping. A missing ack
  /// makes the focus time out and evict the bot.
  async fn handle_conference_modify(&self, iq_id: String, from: Jid, payload: Element) -> Result<()> {
    self.ack_iq(from, iq_id).await?;

    let meeting_id = payload.attr("meeting-id").map(ToOwned::to_owned);
    let name = payload.attr("name").map(ToOwned::to_owned);
    if let (Some(meeting_id), Some(name)) = (meeting_id, name) {
      let short = Self::short_name(&name).to_owned();
      self.conference_ids.insert(&short, &name, &meeting_id).await;
    }
    Ok(())
  }

  async fn handle_disco_info(&self, iq_id: String, from: Jid, query: DiscoInfoQuery) -> Result<()> {
    debug!("disco#info query from {} for node {:?}", from, query.node);
    let mut disco_info = DISCO_INFO.clone();
    disco_info.node = query.node;
    let iq = Iq::from_result(iq_id, Some(disco_info))
      .with_from(Jid::Full(self.jid.clone()))
      .with_to(from);
    self.connection.send_stanza(iq.into()).await
  }

  async fn handle_iq(&self, iq: Iq) -> Result<()> {
    let from = iq.from.clone().ok_or_else(|| anyhow!("iq missing from"))?;

    match iq.payload {
      IqType::Get(element) => {
        // XEP-0199 keepalive.
        if element.is("ping", "urn:xmpp:ping") {
          return self.ack_iq(from, iq.id).await;
        }
        if let Ok(query) = DiscoInfoQuery::try_from(element) {
          return self.handle_disco_info(iq.id, from, query).await;
        }
        Ok(())
      },
      IqType::Set(element) => {
        if element.is("conference-modify", jitsi_ns::COLIBRI2) {
          return self.handle_conference_modify(iq.id, from, element).await;
        }
        match Jingle::try_from(element) {
          Ok(jingle) => {
            let Jid::Full(from_full) = from
            else {
              debug!("Jingle iq from bare JID ignored");
              return Ok(());
            };
            match jingle.action {
              Action::SessionInitiate => {
                self.handle_session_initiate(iq.id, from_full, jingle).await
              },
              Action::TransportInfo => self.handle_transport_info(iq.id, from_full, jingle).await,
              Action::SessionTerminate => {
                self.handle_session_terminate(iq.id, from_full, jingle).await
              },
              Action::SourceAdd | Action::SourceRemove => {
                // Only the primary SSRC per participant is captured; later
                // layers and removals do not change the recording plan.
                self.ack_iq(Jid::Full(from_full), iq.id).await
              },
              other => {
                debug!("unhandled Jingle action {:?}", other);
                self.ack_iq(Jid::Full(from_full), iq.id).await
              },
            }
          },
          Err(e) => {
            debug!("iq set payload did not parse as Jingle: {:?}", e);
            Ok(())
          },
        }
      },
      _ => Ok(()),
    }
  }
}

#[async_trait]
impl StanzaHandler for RecorderSession {
  fn wants(&self, element: &Element) -> bool {
    element.is("presence", ns::DEFAULT_NS) || element.is("iq", ns::DEFAULT_NS)
  }

  async fn handle(&self, element: Element) -> Result<()> {
    if element.is("presence", ns::DEFAULT_NS) {
      let presence = Presence::try_from(element)?;
      let Some(Jid::Full(from)) = presence.from.clone()
      else {
        return Ok(());
      };
      let bare = BareJid::from(from.clone());

      if bare == self.config.brewery_muc {
        return self.handle_brewery_presence(presence, from).await;
      }
      let is_joined_room = self
        .inner
        .lock()
        .await
        .joined_rooms
        .contains_key(&bare.to_string());
      if is_joined_room {
        return self.handle_room_presence(presence, from).await;
      }
      return Ok(());
    }

    if let Ok(iq) = Iq::try_from(element) {
      return self.handle_iq(iq).await;
    }
    Ok(())
  }
}
