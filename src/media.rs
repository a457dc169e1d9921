//! Media-relay subprocess supervision.
//!
//! The gateway owns the media-relay's lifecycle: it spawns the binary when the
//! stream descriptor file exists, restarts it once per crash after a short
//! backoff, restarts it deliberately when the descriptor's mtime changes, and
//! terminates it on shutdown. At most one child exists at any time; all
//! spawn paths go through [`MediaSupervisor::start`], which holds the handle
//! lock across the existence check and the spawn.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MediaConfig;
use crate::store::epoch_now;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media-relay binary not found at {0}")]
    BinaryMissing(PathBuf),
    #[error("stream descriptor not found at {0}")]
    DescriptorMissing(PathBuf),
    #[error("failed to spawn media-relay: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Lifecycle state, for logs and the `/live` availability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    Stopped,
    Starting,
    Running,
    Crashed,
}

/// Per-child bookkeeping; exists exactly while a child does.
struct ChildHandle {
    pid: u32,
    /// Descriptor mtime at spawn, compared by the watcher.
    descriptor_mtime: SystemTime,
    /// Flipped to request a deliberate (no-restart) termination.
    stop_tx: watch::Sender<bool>,
}

pub struct MediaSupervisor {
    cfg: MediaConfig,
    handle: Mutex<Option<ChildHandle>>,
    status: std::sync::Mutex<MediaStatus>,
    restart_count: AtomicU32,
    last_exit_code: std::sync::Mutex<Option<i32>>,
    /// Suppresses crash restarts once gateway shutdown has begun.
    shutting_down: AtomicBool,
    /// Ensures "missing binary/descriptor" is logged once per absence, not
    /// once per poll tick.
    missing_logged: AtomicBool,
}

impl MediaSupervisor {
    pub fn new(cfg: MediaConfig) -> Self {
        Self {
            cfg,
            handle: Mutex::new(None),
            status: std::sync::Mutex::new(MediaStatus::Stopped),
            restart_count: AtomicU32::new(0),
            last_exit_code: std::sync::Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            missing_logged: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> MediaStatus {
        *self.status.lock().expect("status mutex poisoned")
    }

    fn set_status(&self, s: MediaStatus) {
        *self.status.lock().expect("status mutex poisoned") = s;
    }

    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.handle.lock().await.as_ref().map(|h| h.pid)
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        *self.last_exit_code.lock().expect("exit code mutex poisoned")
    }

    /// Spawn the media-relay if it is not already running.
    ///
    /// Holding the handle lock from the existence check through the spawn is
    /// what makes concurrent callers (watcher tick racing a crash-restart)
    /// safe: the loser sees `Some` and returns.
    ///
    /// Boxed: the crash-restart task calls back into `start`, which would
    /// otherwise make the future type recursive.
    pub fn start(
        self: &Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<(), MediaError>> + Send + '_>> {
        Box::pin(self.start_inner())
    }

    async fn start_inner(self: &Arc<Self>) -> Result<(), MediaError> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        let binary = Path::new(&self.cfg.binary_path);
        if !binary.exists() {
            return Err(MediaError::BinaryMissing(binary.to_path_buf()));
        }
        let descriptor = Path::new(&self.cfg.config_path);
        let descriptor_mtime = match std::fs::metadata(descriptor) {
            Ok(meta) => meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            Err(_) => return Err(MediaError::DescriptorMissing(descriptor.to_path_buf())),
        };

        self.set_status(MediaStatus::Starting);
        let child = Command::new(binary)
            .arg("-c")
            .arg(descriptor)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().unwrap_or_default();
        info!("Media-relay started (pid {pid})");
        self.missing_logged.store(false, Ordering::Relaxed);

        let (stop_tx, stop_rx) = watch::channel(false);
        *handle = Some(ChildHandle {
            pid,
            descriptor_mtime,
            stop_tx,
        });
        drop(handle);

        self.set_status(MediaStatus::Running);
        tokio::spawn(self.clone().probe_api());
        tokio::spawn(self.clone().supervise(child, stop_rx));
        Ok(())
    }

    /// Bounded startup probe against the relay's local API port. A slow start
    /// is logged, never killed.
    async fn probe_api(self: Arc<Self>) {
        let addr = format!("127.0.0.1:{}", self.cfg.api_port);
        let deadline = Duration::from_secs(self.cfg.startup_probe_secs);
        let probe = async {
            loop {
                if tokio::net::TcpStream::connect(&addr).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        };
        match tokio::time::timeout(deadline, probe).await {
            Ok(()) => debug!("Media-relay API is accepting connections on {addr}"),
            Err(_) => warn!(
                "Media-relay API did not answer on {addr} within {}s",
                self.cfg.startup_probe_secs
            ),
        }
    }

    /// Owns the child until it exits or a deliberate stop is requested.
    async fn supervise(self: Arc<Self>, mut child: Child, mut stop_rx: watch::Receiver<bool>) {
        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop_rx.changed() => None,
        };

        match exit {
            // Deliberate stop: SIGTERM, bounded wait, then SIGKILL.
            None => {
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
                let waited =
                    tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                if waited.is_err() {
                    warn!("Media-relay ignored SIGTERM, killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                self.clear_handle().await;
                self.set_status(MediaStatus::Stopped);
                info!("Media-relay stopped");
            }
            Some(Ok(status)) => {
                self.clear_handle().await;
                *self.last_exit_code.lock().expect("exit code mutex poisoned") = status.code();
                if status.success() || self.shutting_down.load(Ordering::Relaxed) {
                    self.set_status(MediaStatus::Stopped);
                    info!("Media-relay exited ({status})");
                } else {
                    self.set_status(MediaStatus::Crashed);
                    let code = status.code().unwrap_or(-1);
                    self.append_crash_log(code).await;
                    error!(
                        "Media-relay crashed (code {code}), restarting in {}s",
                        self.cfg.restart_backoff_secs
                    );
                    self.restart_count.fetch_add(1, Ordering::Relaxed);
                    let sup = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(sup.cfg.restart_backoff_secs))
                            .await;
                        if sup.shutting_down.load(Ordering::Relaxed) {
                            return;
                        }
                        if let Err(e) = sup.start().await {
                            warn!("Media-relay restart failed: {e}");
                            // Back to Stopped so the watcher may try again.
                            sup.set_status(MediaStatus::Stopped);
                        }
                    });
                }
            }
            Some(Err(e)) => {
                self.clear_handle().await;
                self.set_status(MediaStatus::Stopped);
                error!("Media-relay wait failed: {e}");
            }
        }
    }

    async fn clear_handle(&self) {
        *self.handle.lock().await = None;
    }

    /// One line per crash, timestamped, appended.
    async fn append_crash_log(&self, code: i32) {
        let line = format!("{} media-relay exited with code {code}\n", epoch_now());
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cfg.crash_log)
            .await;
        match result {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("Failed to append crash log: {e}");
                }
            }
            Err(e) => warn!("Failed to open crash log {}: {e}", self.cfg.crash_log),
        }
    }

    /// Deliberate stop + fresh spawn, used when the stream descriptor changes.
    async fn restart(self: &Arc<Self>) {
        self.signal_stop().await;
        self.wait_stopped(Duration::from_secs(10)).await;
        if let Err(e) = self.start().await {
            warn!("Media-relay restart after descriptor change failed: {e}");
        }
    }

    async fn signal_stop(&self) {
        let handle = self.handle.lock().await;
        if let Some(h) = handle.as_ref() {
            let _ = h.stop_tx.send(true);
        }
    }

    async fn wait_stopped(&self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, async {
            while self.is_running().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
    }

    /// Shutdown path: suppress restarts, terminate the child, wait for it.
    pub async fn stop(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.signal_stop().await;
        self.wait_stopped(Duration::from_secs(10)).await;
    }

    /// Background watcher: polls the stream descriptor and reconciles the
    /// child's state with it. Appearance triggers a start, an mtime change
    /// triggers a deliberate restart, absence leaves a running child alone.
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let sup = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(sup.cfg.poll_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if sup.shutting_down.load(Ordering::Relaxed) {
                    return;
                }
                sup.poll_descriptor().await;
            }
        })
    }

    async fn poll_descriptor(self: &Arc<Self>) {
        let mtime = tokio::fs::metadata(&self.cfg.config_path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
        let Some(mtime) = mtime else {
            return;
        };

        let running_mtime = self
            .handle
            .lock()
            .await
            .as_ref()
            .map(|h| h.descriptor_mtime);
        match running_mtime {
            // A crash leaves the handle empty while its single scheduled
            // restart is pending; the watcher must not race the backoff.
            None if self.status() == MediaStatus::Crashed => {}
            None => match self.start().await {
                Ok(()) => {}
                Err(e @ (MediaError::BinaryMissing(_) | MediaError::DescriptorMissing(_))) => {
                    if !self.missing_logged.swap(true, Ordering::Relaxed) {
                        warn!("Media-relay not started: {e}");
                    }
                }
                Err(e) => warn!("Media-relay start failed: {e}"),
            },
            Some(seen) if seen != mtime => {
                info!("Stream descriptor changed, restarting media-relay");
                self.restart().await;
            }
            Some(_) => {}
        }
    }
}
