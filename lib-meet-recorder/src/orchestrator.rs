//! Top-level recording state: recording ↔ room ↔ capture job ↔ allocation
//! session, plus dynamic segment rotation on participant change.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
  bridge_rest::LegacyColibriClient,
  capture::{build_capture_command, CaptureJob},
  colibri::Allocation,
  config::Settings,
  error::ApiError,
  manifest::{build_manifest, write_manifest, Manifest, ParticipantInput},
  session::RecorderSession,
  simulator::ColibriSimulator,
  util::timestamp_str,
};

const BRIDGE_DISCOVERY_WAIT: Duration = Duration::from_secs(10);
const BRIDGE_DISCOVERY_POLL: Duration = Duration::from_millis(100);

/// An endpoint in a start request: either a bare id or an object with a
/// display name.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EndpointSpec {
  Id(String),
  Object {
    id: String,
    #[serde(default)]
    name: String,
  },
}

impl EndpointSpec {
  fn id(&self) -> &str {
    match self {
      EndpointSpec::Id(id) => id,
      EndpointSpec::Object { id, .. } => id,
    }
  }

  fn name(&self) -> &str {
    match self {
      EndpointSpec::Id(_) => "",
      EndpointSpec::Object { name, .. } => name,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
  pub room: Option<String>,
  #[serde(default)]
  pub mix: bool,
  pub participants: Option<Vec<EndpointSpec>>,
  pub inputs: Option<Vec<ParticipantInput>>,
  pub use_colibri: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingView {
  pub id: String,
  pub status: String,
  pub manifest: Manifest,
}

/// How a recording's forwarders were obtained, and what release requires.
#[derive(Debug, Clone, Default)]
pub struct AllocationSession {
  pub room: String,
  pub endpoint_ids: Vec<String>,
  pub via_xmpp: bool,
  pub auto_discovered: bool,
  pub simulated: bool,
  /// Legacy HTTP session, when the fallback path allocated.
  pub session_id: Option<String>,
  /// The concrete allocations to expire on the XMPP path.
  pub allocations: Vec<Allocation>,
}

#[derive(Default)]
struct RecordingState {
  jobs: HashMap<String, CaptureJob>,
  sessions: HashMap<String, AllocationSession>,
  /// room short name → recording id
  room_to_recording: HashMap<String, String>,
}

/// Owns every recording in the process. All mutation goes through here.
pub struct Orchestrator {
  settings: Settings,
  session: Option<RecorderSession>,
  simulator: Option<ColibriSimulator>,
  state: Mutex<RecordingState>,
}

impl Orchestrator {
  pub fn new(settings: Settings, session: Option<RecorderSession>) -> Self {
    let simulator = settings.simulate.then(ColibriSimulator::default);
    Self {
      settings,
      session,
      simulator,
      state: Mutex::new(RecordingState::default()),
    }
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn session(&self) -> Option<&RecorderSession> {
    self.session.as_ref()
  }

  fn segment_dir(&self, room: &str) -> PathBuf {
    self
      .settings
      .recordings_root
      .join(room)
      .join(timestamp_str(Utc::now()))
  }

  /// Input resolution, in precedence order: explicit inputs, automatic
  /// discovery, per-participant allocation, legacy HTTP fallback.
  async fn resolve_inputs(
    &self,
    body: &StartRequest,
  ) -> Result<(Vec<ParticipantInput>, Option<AllocationSession>), ApiError> {
    if let Some(inputs) = &body.inputs {
      return Ok((inputs.clone(), None));
    }

    let room = body.room.as_deref().unwrap_or_default();

    // Automatic discovery: the bot is already in the room and tracked
    // participants have forwarders.
    if let Some(session) = &self.session {
      if session.ready() && session.is_in_conference(room).await {
        let auto = session.get_participants_with_forwarders(room).await;
        if !auto.is_empty() {
          info!(
            "auto-discovered {} participants with forwarders in {}",
            auto.len(),
            room
          );
          return Ok((
            auto.clone(),
            Some(AllocationSession {
              room: room.to_owned(),
              endpoint_ids: auto.iter().map(|p| p.id.clone()).collect(),
              via_xmpp: true,
              auto_discovered: true,
              ..Default::default()
            }),
          ));
        }
      }
    }

    let endpoints: Vec<(String, String)> = body
      .participants
      .as_deref()
      .unwrap_or_default()
      .iter()
      .map(|spec| (spec.id().to_owned(), spec.name().to_owned()))
      .collect();
    let use_colibri = body.use_colibri.unwrap_or(true);

    if use_colibri && !endpoints.is_empty() {
      if let Some(simulator) = &self.simulator {
        let participants = simulator.allocate_forwarders(&endpoints).await;
        return Ok((
          participants,
          Some(AllocationSession {
            room: room.to_owned(),
            endpoint_ids: endpoints.iter().map(|(id, _)| id.clone()).collect(),
            simulated: true,
            ..Default::default()
          }),
        ));
      }

      if let Some(session) = &self.session {
        if !session.ready() {
          return Err(ApiError::unavailable("XMPP session not ready"));
        }

        // The brewery may still be filling up; give discovery a moment.
        let mut waited = Duration::ZERO;
        while session.bridge_jid().await.is_none() && waited < BRIDGE_DISCOVERY_WAIT {
          tokio::time::sleep(BRIDGE_DISCOVERY_POLL).await;
          waited += BRIDGE_DISCOVERY_POLL;
        }
        if session.bridge_jid().await.is_none() {
          return Err(ApiError::bad_gateway("no bridge discovered via XMPP"));
        }

        let mut participants = vec![];
        let mut allocations = vec![];
        for (id, name) in &endpoints {
          match session.allocate_forwarder(room, id).await {
            Ok(allocation) => {
              participants.push(ParticipantInput {
                id: id.clone(),
                name: name.clone(),
                jid: None,
                rtp_url: allocation.rtp_url(),
                ssrc: allocation.ssrc,
                pt: Some(allocation.payload_type),
                forwarder: serde_json::json!({
                  "ip": allocation.host,
                  "port": allocation.port,
                  "channel_id": allocation.channel_id,
                }),
              });
              allocations.push(allocation);
            },
            // One failed endpoint does not abort the whole recording; it is
            // simply absent from the manifest.
            Err(e) => warn!("forwarder allocation for {} failed: {:?}", id, e),
          }
        }
        if participants.is_empty() {
          return Err(ApiError::bad_gateway(
            "forwarder allocation failed for every endpoint",
          ));
        }
        return Ok((
          participants,
          Some(AllocationSession {
            room: room.to_owned(),
            endpoint_ids: allocations.iter().map(|a| a.endpoint_id.clone()).collect(),
            via_xmpp: true,
            allocations,
            ..Default::default()
          }),
        ));
      }

      if let Some(base_url) = &self.settings.colibri2_url {
        let client = LegacyColibriClient::new(base_url);
        let endpoint_ids: Vec<String> = endpoints.iter().map(|(id, _)| id.clone()).collect();
        let allocation = client
          .allocate_audio_forwarders(room, &endpoint_ids)
          .await
          .map_err(|e| ApiError::bad_gateway(format!("colibri allocation failed: {e:#}")))?;

        let session_id = allocation
          .get("session_id")
          .or_else(|| allocation.get("sessionId"))
          .and_then(|v| v.as_str())
          .map(ToOwned::to_owned);
        let name_map: HashMap<&str, &str> = endpoints
          .iter()
          .map(|(id, name)| (id.as_str(), name.as_str()))
          .collect();

        let mut participants = vec![];
        for ep in allocation
          .get("endpoints")
          .and_then(|v| v.as_array())
          .cloned()
          .unwrap_or_default()
        {
          let audio = ep.get("audio").cloned().unwrap_or_default();
          let ip = audio
            .get("ip")
            .or_else(|| audio.get("host"))
            .and_then(|v| v.as_str())
            .unwrap_or("127.0.0.1")
            .to_owned();
          let port = match audio.get("port").and_then(|v| v.as_u64()) {
            Some(port) => port,
            None => continue,
          };
          let id = ep
            .get("id")
            .or_else(|| ep.get("endpoint"))
            .or_else(|| ep.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
          participants.push(ParticipantInput {
            name: name_map.get(id.as_str()).unwrap_or(&"").to_string(),
            id,
            jid: None,
            rtp_url: format!("rtp://{}:{}", ip, port),
            ssrc: audio.get("ssrc").and_then(|v| v.as_u64()).map(|v| v as u32),
            pt: None,
            forwarder: audio,
          });
        }
        if participants.is_empty() {
          return Err(ApiError::bad_gateway(
            "Colibri allocation returned no participants/ports",
          ));
        }
        return Ok((
          participants,
          Some(AllocationSession {
            room: room.to_owned(),
            endpoint_ids,
            session_id,
            ..Default::default()
          }),
        ));
      }

      return Err(ApiError::not_implemented(
        "no allocation path configured (XMPP, simulator or JVB_COLIBRI2_URL)",
      ));
    }

    Err(ApiError::bad_request(
      "Provide `inputs` with rtp_url or enable Colibri with participants.",
    ))
  }

  /// Start a new recording: resolve inputs, spawn the capture job, persist
  /// the manifest.
  pub async fn start(&self, body: StartRequest) -> Result<RecordingView, ApiError> {
    let room = body
      .room
      .clone()
      .ok_or_else(|| ApiError::bad_request("room is required"))?;

    let (participants, allocation_session) = self.resolve_inputs(&body).await?;

    let rec_id = Uuid::new_v4().to_string();
    self
      .start_segment(&room, rec_id, participants, body.mix, allocation_session)
      .await
  }

  async fn start_segment(
    &self,
    room: &str,
    rec_id: String,
    participants: Vec<ParticipantInput>,
    mix: bool,
    allocation_session: Option<AllocationSession>,
  ) -> Result<RecordingView, ApiError> {
    let out_dir = self.segment_dir(room);
    let manifest = build_manifest(
      room,
      &participants,
      &out_dir,
      &rec_id,
      mix,
      allocation_session
        .as_ref()
        .and_then(|s| s.session_id.clone()),
    );

    let command = build_capture_command(&participants, &out_dir, mix);
    let mut job = CaptureJob::new(command, out_dir.clone(), manifest.clone());
    job
      .start()
      .await
      .map_err(|e| ApiError::internal(format!("failed to start capture: {e:#}")))?;
    let status = job.status();

    {
      let mut state = self.state.lock().await;
      state.jobs.insert(rec_id.clone(), job);
      if let Some(session) = allocation_session {
        state.sessions.insert(rec_id.clone(), session);
      }
      state
        .room_to_recording
        .insert(room.to_owned(), rec_id.clone());
    }

    write_manifest(&out_dir, &manifest)
      .await
      .map_err(|e| ApiError::internal(format!("failed to write manifest: {e:#}")))?;

    Ok(RecordingView {
      id: rec_id,
      status,
      manifest,
    })
  }

  pub async fn get(&self, rec_id: &str) -> Result<RecordingView, ApiError> {
    let mut state = self.state.lock().await;
    let job = state
      .jobs
      .get_mut(rec_id)
      .ok_or_else(|| ApiError::not_found("not found"))?;
    Ok(RecordingView {
      id: rec_id.to_owned(),
      status: job.status(),
      manifest: job.manifest.clone(),
    })
  }

  /// Stop a recording: terminate the capture, finalize the manifest, release
  /// the allocation session, drop the table entries. Strictly in that order.
  pub async fn stop_and_release(&self, rec_id: &str) -> Result<(), ApiError> {
    let mut state = self.state.lock().await;
    match state.jobs.get_mut(rec_id) {
      Some(job) => {
        job.stop().await;
        let tail = job.tail().await;
        job.manifest.finalize(tail);
        if let Err(e) = write_manifest(&job.workdir, &job.manifest).await {
          warn!("failed to finalize manifest for {}: {:?}", rec_id, e);
        }
      },
      None => return Err(ApiError::not_found("not found")),
    }

    if let Some(allocation_session) = state.sessions.get(rec_id).cloned() {
      self.release_allocation_session(&allocation_session).await;
    }

    state.jobs.remove(rec_id);
    state.sessions.remove(rec_id);
    state.room_to_recording.retain(|_, id| id != rec_id);
    Ok(())
  }

  /// Release whatever the allocation session holds; each endpoint failure is
  /// logged and ignored.
  async fn release_allocation_session(&self, allocation_session: &AllocationSession) {
    if allocation_session.simulated {
      return;
    }
    if allocation_session.via_xmpp {
      if let Some(session) = &self.session {
        if allocation_session.auto_discovered {
          session.release_room_forwarders(&allocation_session.room).await;
        }
        else {
          for allocation in &allocation_session.allocations {
            session.release_forwarder(allocation).await;
          }
        }
      }
      return;
    }
    if let Some(session_id) = &allocation_session.session_id {
      if let Some(base_url) = &self.settings.colibri2_url {
        LegacyColibriClient::new(base_url).release(session_id).await;
      }
    }
  }

  /// Stop and restart with fresh inputs, reusing the recording id.
  pub async fn refresh(
    &self,
    rec_id: &str,
    mut body: StartRequest,
  ) -> Result<RecordingView, ApiError> {
    let (room, mix) = {
      let state = self.state.lock().await;
      let job = state
        .jobs
        .get(rec_id)
        .ok_or_else(|| ApiError::not_found("not found"))?;
      (
        body.room.clone().unwrap_or_else(|| job.manifest.room.clone()),
        body.mix,
      )
    };
    body.room = Some(room.clone());

    let (participants, allocation_session) = self.resolve_inputs(&body).await?;
    self.stop_and_release(rec_id).await?;
    self
      .start_segment(&room, rec_id.to_owned(), participants, mix, allocation_session)
      .await
  }

  /// Dynamic segment rotation: a participant joined or left a room with a
  /// running recording, so cut a new segment with the updated set.
  pub async fn handle_participant_change(&self, room: &str) {
    let room_short = room.split('@').next().unwrap_or(room).to_owned();

    let rec_id = {
      let state = self.state.lock().await;
      match state.room_to_recording.get(&room_short) {
        Some(rec_id) => rec_id.clone(),
        None => return,
      }
    };

    let (mix, running) = {
      let mut state = self.state.lock().await;
      match state.jobs.get_mut(&rec_id) {
        Some(job) => (job.manifest.mix, job.is_running()),
        None => return,
      }
    };
    if !running {
      return;
    }

    let participants = match &self.session {
      Some(session) => session.get_participants_with_forwarders(room).await,
      None => return,
    };

    info!(
      "participant change in {}; rotating segment for {} ({} participants)",
      room,
      rec_id,
      participants.len()
    );

    if participants.is_empty() {
      info!("no participants left in {}; stopping {}", room, rec_id);
      if let Err(e) = self.stop_and_release(&rec_id).await {
        warn!("stopping {} after empty rotation failed: {}", rec_id, e);
      }
      return;
    }

    // Stop only the job; the allocation session carries over to the next
    // segment under the same recording id.
    let old_job = {
      let mut state = self.state.lock().await;
      state.jobs.remove(&rec_id)
    };
    if let Some(mut job) = old_job {
      job.stop().await;
      let tail = job.tail().await;
      job.manifest.finalize(tail);
      if let Err(e) = write_manifest(&job.workdir, &job.manifest).await {
        warn!("failed to finalize rotated manifest: {:?}", e);
      }
    }

    if let Err(e) = self
      .start_segment(&room_short, rec_id.clone(), participants, mix, None)
      .await
    {
      warn!("failed to start rotated segment for {}: {}", rec_id, e);
    }
  }

  /// Stop everything; used at shutdown.
  pub async fn stop_all(&self) {
    let rec_ids: Vec<String> = self.state.lock().await.jobs.keys().cloned().collect();
    for rec_id in rec_ids {
      if let Err(e) = self.stop_and_release(&rec_id).await {
        warn!("failed to stop {} at shutdown: {}", rec_id, e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::http::StatusCode;

  fn settings(simulate: bool) -> Settings {
    Settings {
      api_secret: None,
      recordings_root: PathBuf::from("/tmp/recordings-test"),
      http_bind: "127.0.0.1:0".to_owned(),
      xmpp: None,
      bridge_muc: "jvbbrewery@internal-muc.meet.jitsi".to_owned(),
      colibri2_url: None,
      colibri2_ws: None,
      jvb_rest_url: "http://jvb:8080".to_owned(),
      recorder_ws_url: "ws://recorder:8989/record".to_owned(),
      simulate,
      tls_insecure: false,
    }
  }

  fn input(id: &str) -> ParticipantInput {
    ParticipantInput {
      id: id.to_owned(),
      name: String::new(),
      jid: None,
      rtp_url: "rtp://127.0.0.1:50000".to_owned(),
      ssrc: None,
      pt: None,
      forwarder: serde_json::Value::Null,
    }
  }

  #[tokio::test]
  async fn explicit_inputs_take_precedence() {
    let orchestrator = Orchestrator::new(settings(true), None);
    let body = StartRequest {
      room: Some("r1".to_owned()),
      inputs: Some(vec![input("p1")]),
      participants: Some(vec![EndpointSpec::Id("ignored".to_owned())]),
      ..Default::default()
    };
    let (participants, session) = orchestrator.resolve_inputs(&body).await.unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].id, "p1");
    assert!(session.is_none());
  }

  #[tokio::test]
  async fn simulator_allocates_per_participant() {
    let orchestrator = Orchestrator::new(settings(true), None);
    let body = StartRequest {
      room: Some("r1".to_owned()),
      participants: Some(vec![
        EndpointSpec::Id("p1".to_owned()),
        EndpointSpec::Object {
          id: "p2".to_owned(),
          name: "Bob".to_owned(),
        },
      ]),
      ..Default::default()
    };
    let (participants, session) = orchestrator.resolve_inputs(&body).await.unwrap();
    assert_eq!(participants.len(), 2);
    assert!(participants[0].rtp_url.starts_with("rtp://127.0.0.1:"));
    assert_eq!(participants[1].name, "Bob");
    let session = session.unwrap();
    assert!(session.simulated);
    assert_eq!(session.endpoint_ids, vec!["p1".to_owned(), "p2".to_owned()]);
  }

  #[tokio::test]
  async fn nothing_to_record_is_bad_request() {
    let orchestrator = Orchestrator::new(settings(false), None);
    let body = StartRequest {
      room: Some("r1".to_owned()),
      ..Default::default()
    };
    let err = orchestrator.resolve_inputs(&body).await.unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn participants_without_allocation_path_is_not_implemented() {
    let orchestrator = Orchestrator::new(settings(false), None);
    let body = StartRequest {
      room: Some("r1".to_owned()),
      participants: Some(vec![EndpointSpec::Id("p1".to_owned())]),
      ..Default::default()
    };
    let err = orchestrator.resolve_inputs(&body).await.unwrap_err();
    assert_eq!(err.status, StatusCode::NOT_IMPLEMENTED);
  }
}
