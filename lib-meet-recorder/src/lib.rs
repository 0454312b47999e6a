mod bridge_rest;
mod capture;
mod colibri;
mod conference_map;
mod config;
mod connection;
mod error;
mod http;
mod jingle_sdp;
mod manifest;
mod media;
mod orchestrator;
mod participant;
mod prober;
mod session;
mod simulator;
mod source;
mod tls;
mod util;

pub use crate::{
  capture::{build_capture_command, CaptureJob},
  colibri::{Allocation, BridgeCapabilities, ColibriDialect},
  conference_map::ConferenceIdMap,
  config::{Settings, XmppMode, XmppSettings},
  connection::{Authentication, Connection, StanzaHandler},
  error::ApiError,
  http::{router, serve},
  jingle_sdp::{extract_ssrcs, jingle_to_sdp, sdp_to_jingle_accept},
  manifest::{
    audio_filename, build_manifest, sanitize_filename, write_manifest, Manifest, ParticipantInput,
  },
  orchestrator::{EndpointSpec, Orchestrator, RecordingView, StartRequest},
  participant::{Forwarder, Participant, ParticipantChange, ParticipantTracker, RECORDER_NICK},
  session::{RecorderSession, RecorderSessionConfig},
  source::{MediaType, SsrcDescription},
};

#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing(level: tracing::Level) {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
    .with_target(false)
    .init();
}
