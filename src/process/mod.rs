//! Worker process supervision.
//!
//! Spawns exactly one external CLI per live assignment inside a fresh
//! pseudo-terminal (the target CLIs refuse to operate on pipes), writes the
//! prompt into the PTY after a short delay, appends all output to a
//! per-instance log file, and surfaces liveness plus a kill operation.
//! No retry lives here; resurrection is the lifecycle supervisor's concern.

mod echo;
mod session;

pub use echo::EchoStripper;
pub use session::SessionFile;

use crate::errors::SupervisorError;
use crate::providers::InstanceId;
use anyhow::Context;
use chrono::Utc;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Delay before the prompt is written into the PTY; the CLIs need a moment
/// to install their input handlers.
const DEFAULT_PROMPT_DELAY: Duration = Duration::from_millis(1500);

/// How long the echo stripper keeps looking for the echoed prompt.
const ECHO_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace period between SIGTERM and a hard kill.
const STOP_GRACE: Duration = Duration::from_secs(10);

const SESSION_END_BANNER: &[u8] = b"\n=== Session Ended ===\n";

/// Callback receiving the same output bytes the log file gets, for live
/// display by a UI subscriber.
pub type OutputObserver = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub command: String,
    pub args: Vec<String>,
    pub prompt: String,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
    pub instance_id: InstanceId,
    pub assignment_id: Uuid,
    /// Extra environment (`<TOOL>_INSTANCE_ID` etc). `AUTONOMOUS_PARENT_PID`
    /// is always set.
    pub env: Vec<(String, String)>,
}

struct ChildHandle {
    pid: Option<u32>,
    killer: Mutex<Box<dyn portable_pty::ChildKiller + Send + Sync>>,
    exit: watch::Receiver<Option<i32>>,
}

pub struct ProcessSupervisor {
    sessions_dir: PathBuf,
    prompt_delay: Duration,
    children: Mutex<HashMap<InstanceId, ChildHandle>>,
}

impl ProcessSupervisor {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            prompt_delay: DEFAULT_PROMPT_DELAY,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Shorten the prompt delay (tests).
    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }

    /// Launch the worker and return its pid. The process runs until it
    /// exits on its own or [`ProcessSupervisor::stop`] is called; progress
    /// is observed via [`ProcessSupervisor::is_running`].
    pub async fn start(
        &self,
        spec: StartSpec,
        observer: Option<OutputObserver>,
    ) -> Result<u32, SupervisorError> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env("AUTONOMOUS_PARENT_PID", std::process::id().to_string());
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id();
        debug!(instance = %spec.instance_id, pid, command = %spec.command, "worker spawned");

        SessionFile {
            instance_id: spec.instance_id.clone(),
            process_id: pid,
            started_at: Utc::now(),
            assignment_id: spec.assignment_id,
            worktree_path: spec.cwd.clone(),
        }
        .write(&self.sessions_dir)
        .context("failed to write session file")?;

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;
        let master = pair.master;

        let (byte_tx, mut byte_rx) = mpsc::channel::<Vec<u8>>(64);
        let (exit_tx, exit_rx) = watch::channel(None::<i32>);
        let armed = Arc::new(AtomicBool::new(false));

        // PTY read loop (blocking thread). EOF or EIO means the child's side
        // of the terminal is gone.
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if byte_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Log appender: echo-strips once the prompt has been written, then
        // fans bytes out to the log file and the observer. Appends the
        // session banner when the stream ends.
        let log_path = spec.log_path.clone();
        let prompt_for_echo = spec.prompt.clone();
        let armed_for_log = Arc::clone(&armed);
        let log_instance = spec.instance_id.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await;
            let mut file = match file {
                Ok(f) => f,
                Err(e) => {
                    warn!(instance = %log_instance, error = %e, "cannot open worker log");
                    return;
                }
            };
            let mut stripper = EchoStripper::new(&prompt_for_echo, ECHO_TIMEOUT);
            while let Some(chunk) = byte_rx.recv().await {
                let bytes = if armed_for_log.load(Ordering::SeqCst) {
                    stripper.filter(&chunk, Instant::now())
                } else {
                    chunk
                };
                if bytes.is_empty() {
                    continue;
                }
                if let Some(observer) = &observer {
                    observer(&bytes);
                }
                if let Err(e) = file.write_all(&bytes).await {
                    warn!(instance = %log_instance, error = %e, "worker log write failed");
                    break;
                }
            }
            let held = stripper.flush();
            if !held.is_empty() {
                let _ = file.write_all(&held).await;
            }
            let _ = file.write_all(SESSION_END_BANNER).await;
            let _ = file.flush().await;
        });

        // Prompt writer: wait out the initial delay, then type the prompt
        // followed by a carriage return.
        let prompt = spec.prompt.clone();
        let delay = self.prompt_delay;
        let armed_for_writer = Arc::clone(&armed);
        let writer_instance = spec.instance_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Arm the stripper before any echo byte can reach the log task.
            armed_for_writer.store(true, Ordering::SeqCst);
            let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let mut writer = writer;
                writer.write_all(prompt.as_bytes())?;
                writer.write_all(b"\r")?;
                writer.flush()
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(instance = %writer_instance, error = %e, "prompt write failed"),
                Err(e) => warn!(instance = %writer_instance, error = %e, "prompt writer panicked"),
            }
        });

        // Exit watcher (blocking thread): reports the code, then drops the
        // master so the read loop unblocks.
        let wait_instance = spec.instance_id.clone();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    warn!(instance = %wait_instance, error = %e, "wait failed");
                    -1
                }
            };
            debug!(instance = %wait_instance, code, "worker exited");
            let _ = exit_tx.send(Some(code));
            drop(master);
        });

        self.children.lock().insert(
            spec.instance_id.clone(),
            ChildHandle {
                pid,
                killer: Mutex::new(killer),
                exit: exit_rx,
            },
        );

        Ok(pid.unwrap_or(0))
    }

    /// True iff the PTY child has not reported exit and the OS still knows
    /// the pid.
    pub fn is_running(&self, instance_id: &InstanceId) -> bool {
        let children = self.children.lock();
        let Some(handle) = children.get(instance_id) else {
            return false;
        };
        if handle.exit.borrow().is_some() {
            return false;
        }
        match handle.pid {
            Some(pid) => kill(Pid::from_raw(pid as i32), None).is_ok(),
            None => true,
        }
    }

    /// Exit code once the child has exited.
    pub fn exit_code(&self, instance_id: &InstanceId) -> Option<i32> {
        self.children
            .lock()
            .get(instance_id)
            .and_then(|h| *h.exit.borrow())
    }

    /// TERM the worker's process group and return once the child has
    /// reported exit. Escalates to a hard kill after a grace period.
    pub async fn stop(&self, instance_id: &InstanceId) -> Result<(), SupervisorError> {
        let (pid, mut exit) = {
            let children = self.children.lock();
            let handle = children
                .get(instance_id)
                .ok_or_else(|| SupervisorError::UnknownInstance(instance_id.to_string()))?;
            (handle.pid, handle.exit.clone())
        };

        if exit.borrow().is_none() {
            if let Some(pid) = pid {
                let pgid = Pid::from_raw(pid as i32);
                if killpg(pgid, Signal::SIGTERM).is_err() {
                    let _ = kill(pgid, Signal::SIGTERM);
                }
            }

            let graceful =
                tokio::time::timeout(STOP_GRACE, wait_for_exit(&mut exit)).await.is_ok();
            if !graceful {
                warn!(instance = %instance_id, "worker ignored TERM, killing");
                {
                    let children = self.children.lock();
                    if let Some(handle) = children.get(instance_id) {
                        let _ = handle.killer.lock().kill();
                    }
                }
                wait_for_exit(&mut exit).await;
            }
        }

        SessionFile::remove(&self.sessions_dir, instance_id)
            .context("failed to remove session file")?;
        Ok(())
    }

    /// Forget a finished instance and drop its session file.
    pub fn reap(&self, instance_id: &InstanceId) {
        self.children.lock().remove(instance_id);
        if let Err(e) = SessionFile::remove(&self.sessions_dir, instance_id) {
            warn!(instance = %instance_id, error = %e, "failed to remove session file");
        }
    }
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<i32>>) {
    while exit.borrow().is_none() {
        if exit.changed().await.is_err() {
            break;
        }
    }
}
