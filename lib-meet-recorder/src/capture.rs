//! Supervision of the external ffmpeg capture subprocess: spawn, pump its
//! output into a bounded tail, and terminate it gracefully.

use std::{
  collections::VecDeque,
  os::unix::io::FromRawFd,
  path::{Path, PathBuf},
  process::Stdio,
  sync::Arc,
  time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
  io::{AsyncBufReadExt, AsyncRead, BufReader},
  process::{Child, Command},
  sync::Mutex,
  task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::manifest::{audio_filename, Manifest, ParticipantInput};

const LOG_TAIL_LINES: usize = 50;
const STOP_GRACE: Duration = Duration::from_secs(10);
const LOG_PUMP_JOIN: Duration = Duration::from_secs(2);

/// One capture run: a command vector, its working directory, the subprocess
/// handle and a rolling tail of its output.
pub struct CaptureJob {
  pub command: Vec<String>,
  pub workdir: PathBuf,
  pub manifest: Manifest,
  child: Option<Child>,
  log_ring: Arc<Mutex<VecDeque<String>>>,
  log_pump: Option<JoinHandle<()>>,
}

/// One pipe whose write end is handed to the child as both stdout and
/// stderr, so the tail preserves the order the process wrote in.
fn merged_output_pipe() -> Result<(std::fs::File, Stdio, Stdio)> {
  let mut fds = [0 as libc::c_int; 2];
  if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
    return Err(std::io::Error::last_os_error()).context("failed to create capture log pipe");
  }
  let [read_fd, write_fd] = fds;
  let stderr_fd = unsafe { libc::dup(write_fd) };
  if stderr_fd < 0 {
    let err = std::io::Error::last_os_error();
    unsafe {
      libc::close(read_fd);
      libc::close(write_fd);
    }
    return Err(err).context("failed to dup capture log pipe");
  }
  unsafe {
    Ok((
      std::fs::File::from_raw_fd(read_fd),
      Stdio::from_raw_fd(write_fd),
      Stdio::from_raw_fd(stderr_fd),
    ))
  }
}

impl CaptureJob {
  pub fn new(command: Vec<String>, workdir: PathBuf, manifest: Manifest) -> Self {
    Self {
      command,
      workdir,
      manifest,
      child: None,
      log_ring: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL_LINES))),
      log_pump: None,
    }
  }

  fn spawn_log_pump<R>(&mut self, reader: R)
  where
    R: AsyncRead + Unpin + Send + 'static,
  {
    let ring = self.log_ring.clone();
    self.log_pump = Some(tokio::spawn(async move {
      let mut lines = BufReader::new(reader).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        let mut ring = ring.lock().await;
        if ring.len() == LOG_TAIL_LINES {
          ring.pop_front();
        }
        ring.push_back(line);
      }
    }));
  }

  /// Ensure the working directory exists, spawn the subprocess with stdout
  /// and stderr merged onto a single pipe, and start pumping its lines into
  /// the tail ring.
  pub async fn start(&mut self) -> Result<()> {
    tokio::fs::create_dir_all(&self.workdir)
      .await
      .context("failed to create capture working directory")?;

    let (program, args) = self
      .command
      .split_first()
      .context("empty capture command")?;
    info!("starting capture: {}", self.command.join(" "));
    let (log_reader, stdout, stderr) = merged_output_pipe()?;
    let child = Command::new(program)
      .args(args)
      .current_dir(&self.workdir)
      .stdin(Stdio::null())
      .stdout(stdout)
      .stderr(stderr)
      .spawn()
      .context("failed to spawn capture subprocess")?;

    self.spawn_log_pump(tokio::fs::File::from_std(log_reader));
    self.child = Some(child);
    Ok(())
  }

  /// Terminate the subprocess: SIGTERM, wait up to ten seconds, then SIGKILL.
  /// The log pump is given a short window to flush.
  pub async fn stop(&mut self) {
    if let Some(child) = self.child.as_mut() {
      if matches!(child.try_wait(), Ok(None)) {
        if let Some(pid) = child.id() {
          debug!("terminating capture pid {}", pid);
          unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
          }
        }
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
          Ok(Ok(status)) => debug!("capture exited: {}", status),
          Ok(Err(e)) => warn!("waiting for capture exit failed: {:?}", e),
          Err(_) => {
            warn!("capture did not exit within {:?}; killing", STOP_GRACE);
            if let Err(e) = child.kill().await {
              warn!("failed to kill capture: {:?}", e);
            }
          },
        }
      }
    }

    if let Some(pump) = self.log_pump.take() {
      if tokio::time::timeout(LOG_PUMP_JOIN, pump).await.is_err() {
        warn!("log pump did not finish within {:?}", LOG_PUMP_JOIN);
      }
    }
  }

  /// `not_started`, `running` or `exited:<code>`.
  pub fn status(&mut self) -> String {
    match self.child.as_mut() {
      None => "not_started".to_owned(),
      Some(child) => match child.try_wait() {
        Ok(None) => "running".to_owned(),
        Ok(Some(status)) => format!("exited:{}", status.code().unwrap_or(-1)),
        Err(_) => "exited:-1".to_owned(),
      },
    }
  }

  pub fn is_running(&mut self) -> bool {
    self.status() == "running"
  }

  /// Snapshot of the last lines the subprocess printed.
  pub async fn tail(&self) -> Vec<String> {
    self.log_ring.lock().await.iter().cloned().collect()
  }
}

/// Build the ffmpeg argument vector for a set of RTP inputs.
///
/// Each participant contributes one RTP input and one stream-copied Opus
/// output; with `mix` set, an anull→amix filter graph adds an AAC mixdown.
pub fn build_capture_command(
  participants: &[ParticipantInput],
  out_dir: &Path,
  mix: bool,
) -> Vec<String> {
  let mut args: Vec<String> = vec![
    "ffmpeg".to_owned(),
    "-hide_banner".to_owned(),
    "-nostats".to_owned(),
    "-loglevel".to_owned(),
    "info".to_owned(),
  ];

  for p in participants {
    args.extend(
      [
        "-protocol_whitelist",
        "file,udp,rtp,crypto",
        "-use_wallclock_as_timestamps",
        "1",
        "-fflags",
        "+igndts+genpts",
        "-i",
      ]
      .map(str::to_owned),
    );
    args.push(p.rtp_url.clone());
  }

  for (index, p) in participants.iter().enumerate() {
    let out_file = out_dir.join(audio_filename(&p.name, &p.id));
    args.push("-map".to_owned());
    args.push(format!("{}:a", index));
    args.push("-c:a".to_owned());
    args.push("copy".to_owned());
    args.push(out_file.to_string_lossy().into_owned());
  }

  if mix && !participants.is_empty() {
    let mut filter_complex = (0..participants.len())
      .map(|i| format!("[{}:a]anull[a{}]", i, i))
      .collect::<Vec<_>>()
      .join(";");
    let input_refs: String = (0..participants.len()).map(|i| format!("[a{}]", i)).collect();
    filter_complex.push_str(&format!(
      ";{}amix=inputs={}:normalize=0[mixed]",
      input_refs,
      participants.len()
    ));
    args.push("-filter_complex".to_owned());
    args.push(filter_complex);
    args.push("-map".to_owned());
    args.push("[mixed]".to_owned());
    args.push("-c:a".to_owned());
    args.push("aac".to_owned());
    args.push("-movflags".to_owned());
    args.push("+faststart".to_owned());
    args.push(out_dir.join("mix.m4a").to_string_lossy().into_owned());
  }

  args
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::manifest::build_manifest;

  fn participant(id: &str, name: &str, port: u16) -> ParticipantInput {
    ParticipantInput {
      id: id.to_owned(),
      name: name.to_owned(),
      jid: None,
      rtp_url: format!("rtp://127.0.0.1:{}", port),
      ssrc: None,
      pt: None,
      forwarder: serde_json::Value::Null,
    }
  }

  #[test]
  fn command_has_one_input_and_map_per_participant() {
    let participants = vec![participant("p1", "", 50000), participant("p2", "Bob", 50002)];
    let args = build_capture_command(&participants, Path::new("/out"), false);
    assert_eq!(args[0], "ffmpeg");
    assert_eq!(args.iter().filter(|a| *a == "-i").count(), 2);
    assert_eq!(args.iter().filter(|a| *a == "-map").count(), 2);
    assert!(args.contains(&"rtp://127.0.0.1:50000".to_owned()));
    assert!(args.contains(&"/out/audio-p1.opus".to_owned()));
    assert!(args.contains(&"/out/audio-Bob-p2.opus".to_owned()));
    assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "0:a"));
    assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a"));
    assert!(!args.contains(&"-filter_complex".to_owned()));
  }

  #[test]
  fn mix_appends_filter_graph() {
    let participants = vec![participant("p1", "", 50000), participant("p2", "", 50002)];
    let args = build_capture_command(&participants, Path::new("/out"), true);
    let filter_index = args.iter().position(|a| a == "-filter_complex").unwrap();
    assert_eq!(
      args[filter_index + 1],
      "[0:a]anull[a0];[1:a]anull[a1];[a0][a1]amix=inputs=2:normalize=0[mixed]"
    );
    assert!(args.contains(&"[mixed]".to_owned()));
    assert!(args.contains(&"/out/mix.m4a".to_owned()));
  }

  #[test]
  fn mix_without_participants_adds_nothing() {
    let args = build_capture_command(&[], Path::new("/out"), true);
    assert!(!args.contains(&"-filter_complex".to_owned()));
  }

  #[tokio::test]
  async fn job_lifecycle_with_shell_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = build_manifest("room", &[], dir.path(), "rec", false, None);
    let command = vec![
      "sh".to_owned(),
      "-c".to_owned(),
      "echo line-one; echo line-two >&2; echo line-three; sleep 30".to_owned(),
    ];
    let mut job = CaptureJob::new(command, dir.path().to_path_buf(), manifest);
    assert_eq!(job.status(), "not_started");

    job.start().await.unwrap();
    assert_eq!(job.status(), "running");
    tokio::time::sleep(Duration::from_millis(200)).await;

    job.stop().await;
    assert!(job.status().starts_with("exited:"));
    // stdout and stderr share one pipe, so the tail is in write order
    let tail = job.tail().await;
    assert_eq!(
      tail,
      vec![
        "line-one".to_owned(),
        "line-two".to_owned(),
        "line-three".to_owned(),
      ]
    );
  }
}
