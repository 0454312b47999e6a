use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use lib_meet_recorder::{
  init_tracing, Authentication, Connection, Orchestrator, RecorderSession,
  RecorderSessionConfig, Settings,
};
use structopt::StructOpt;
use tokio::{signal::ctrl_c, sync::oneshot, task, time::timeout};
use tracing::{error, info, warn};

const SESSION_READY_TIMEOUT: Duration = Duration::from_secs(10);
const XMPP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, StructOpt)]
#[structopt(
  name = "meet-recorder",
  about = "Join Jitsi Meet conferences as a silent participant and record per-participant audio."
)]
struct Opt {
  #[structopt(short, long, parse(from_occurrences))]
  verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
  let opt = Opt::from_args();

  init_tracing(match opt.verbose {
    0 => tracing::Level::INFO,
    1 => tracing::Level::DEBUG,
    _ => tracing::Level::TRACE,
  });

  let settings = Settings::from_env().context("invalid configuration")?;
  info!(
    "starting (xmpp_enabled={}, simulation_mode={})",
    settings.xmpp_enabled(),
    settings.simulate
  );

  let mut xmpp_task: Option<task::JoinHandle<()>> = None;
  let session = if settings.xmpp_enabled() {
    let xmpp = settings.xmpp.clone().context("xmpp settings missing")?;
    let (connection, background) = Connection::new(
      &xmpp.websocket_url(),
      &xmpp.domain,
      Authentication::Plain {
        username: xmpp.jid_local_part().to_owned(),
        password: xmpp.password.clone(),
      },
      settings.tls_insecure,
    )
    .await
    .context("failed to open XMPP connection")?;
    xmpp_task = Some(tokio::spawn(background));
    connection.connect().await.context("XMPP login failed")?;

    let session = RecorderSession::start(
      connection,
      RecorderSessionConfig {
        domain: xmpp.domain.clone(),
        muc_domain: format!("muc.{}", xmpp.domain),
        brewery_muc: settings
          .bridge_muc
          .parse()
          .context("invalid JVB_BRIDGE_MUC")?,
        brewery_nick: xmpp.jid_local_part().to_owned(),
        jvb_rest_url: settings.jvb_rest_url.clone(),
        recorder_ws_url: settings.recorder_ws_url.clone(),
      },
    )
    .await
    .context("failed to start recorder session")?;

    match session.wait_ready(SESSION_READY_TIMEOUT).await {
      Ok(()) => info!("recorder session ready"),
      Err(e) => warn!("recorder session not ready yet, continuing: {:?}", e),
    }
    Some(session)
  }
  else {
    None
  };

  let orchestrator = Arc::new(Orchestrator::new(settings.clone(), session.clone()));

  if let Some(session) = &session {
    let orchestrator_for_changes = orchestrator.clone();
    session
      .tracker
      .set_change_callback(move |room, _change, _participant| {
        let orchestrator = orchestrator_for_changes.clone();
        Box::pin(async move {
          orchestrator.handle_participant_change(&room).await;
          Ok(())
        })
      })
      .await;
  }

  let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
  let server = {
    let orchestrator = orchestrator.clone();
    let bind = settings.http_bind.clone();
    tokio::spawn(async move {
      if let Err(e) = lib_meet_recorder::serve(orchestrator, &bind, async {
        let _ = shutdown_rx.await;
      })
      .await
      {
        error!("control plane exited: {:?}", e);
      }
    })
  };

  ctrl_c().await.context("failed to listen for ctrl-c")?;
  info!("shutting down");

  let _ = shutdown_tx.send(());
  orchestrator.stop_all().await;

  if let Some(handle) = xmpp_task {
    handle.abort();
    if timeout(XMPP_SHUTDOWN_TIMEOUT, handle).await.is_err() {
      warn!("XMPP task did not finish within {:?}", XMPP_SHUTDOWN_TIMEOUT);
    }
  }
  let _ = timeout(Duration::from_secs(5), server).await;

  Ok(())
}
