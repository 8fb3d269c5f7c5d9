//! Supervision of the single reverse-proxy process
//!
//! The supervisor owns at most one proxy instance. `start` and `stop` are
//! serialized behind one async lock so two callers can never race past the
//! idle check. The instance itself lives in a slot guarded by a sync mutex
//! that background tasks also use to clear it.
//!
//! Each instance gets three background tasks:
//! - a stdout reader forwarding lines to the log,
//! - a stderr reader that, under [`StderrPolicy::Fatal`], clears the handle on
//!   the first line,
//! - an exit watcher that owns the child, reaps it and clears the handle.
//!
//! The readers are bound to a per-instance shutdown channel and stop as soon
//! as the handle is cleared. Generations keep a late task from an old instance
//! from clearing a newer one.

use crate::config::{absolutize, ProxyConfig, StderrPolicy};
use crate::error::{StartError, StopError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State of the supervised proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No process handle
    Idle,
    /// Writing the config and spawning
    Starting,
    /// Process spawned and handle held
    Running,
    /// Kill delivered, waiting for exit
    Stopping,
}

/// Information about the running proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Absolute path of the configuration the proxy was started with
    pub config_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Why a process handle was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    /// Output on the error stream under the fatal policy
    ErrorOutput,
    /// The process exited on its own
    Exited,
    /// Killed by `stop`
    Stopped,
    /// The kill signal could not be delivered
    TerminationFailed,
}

/// Lifecycle events broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { pid: u32 },
    Stdout { pid: u32, line: String },
    Stderr { pid: u32, line: String },
    Exited { pid: u32, code: Option<i32> },
    Cleared { pid: u32, reason: ClearReason },
}

struct Instance {
    handle: ProcessHandle,
    generation: u64,
    /// Flips to true once the exit watcher has reaped the child
    exit_rx: watch::Receiver<bool>,
    /// Dropping or signalling this stops the output readers
    shutdown_tx: watch::Sender<bool>,
}

struct Slot {
    state: SupervisorState,
    instance: Option<Instance>,
    next_generation: u64,
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Owns the lifecycle of at most one proxy process.
///
/// [`new`](ProxySupervisor::new) returns `Arc<Self>`; `start` needs `&Arc<Self>`
/// to hand clones to the background tasks it spawns.
pub struct ProxySupervisor {
    config: ProxyConfig,
    slot: Mutex<Slot>,
    /// Serializes start and stop
    lifecycle: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ProcessEvent>,
    /// Signal sent to the process group on stop
    #[cfg(unix)]
    stop_signal: i32,
}

impl ProxySupervisor {
    pub fn new(config: ProxyConfig) -> Arc<Self> {
        Arc::new(Self::unshared(config))
    }

    fn unshared(config: ProxyConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            slot: Mutex::new(Slot {
                state: SupervisorState::Idle,
                instance: None,
                next_generation: 0,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            events,
            #[cfg(unix)]
            stop_signal: libc::SIGKILL,
        }
    }

    /// Supervisor that sends `signal` instead of SIGKILL on stop
    #[cfg(all(test, unix))]
    fn with_stop_signal(config: ProxyConfig, signal: i32) -> Arc<Self> {
        Arc::new(Self {
            stop_signal: signal,
            ..Self::unshared(config)
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// True while a live process handle is held
    pub fn status(&self) -> bool {
        self.slot.lock().instance.is_some()
    }

    pub fn state(&self) -> SupervisorState {
        self.slot.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.slot.lock().instance.as_ref().map(|i| i.handle.pid)
    }

    pub fn handle(&self) -> Option<ProcessHandle> {
        self.slot.lock().instance.as_ref().map(|i| i.handle.clone())
    }

    /// Receive lifecycle events for every instance started after subscribing
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ProcessEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Write `config_text` to the config path and spawn the proxy against it.
    ///
    /// Returns as soon as the OS has assigned a pid; the proxy's own
    /// initialization is not awaited.
    pub async fn start(self: &Arc<Self>, config_text: &str) -> Result<ProcessHandle, StartError> {
        let _guard = self.lifecycle.lock().await;

        {
            let mut slot = self.slot.lock();
            if let Some(ref instance) = slot.instance {
                debug!(pid = instance.handle.pid, "Proxy already running");
                return Err(StartError::AlreadyRunning {
                    pid: instance.handle.pid,
                });
            }
            slot.state = SupervisorState::Starting;
        }

        match self.launch(config_text).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.slot.lock().state = SupervisorState::Idle;
                error!(error = %e, "Failed to start proxy");
                Err(e)
            }
        }
    }

    async fn launch(self: &Arc<Self>, config_text: &str) -> Result<ProcessHandle, StartError> {
        let config_path = absolutize(&self.config.config_path);

        write_config(&config_path, config_text)
            .await
            .map_err(|source| StartError::WriteConfig {
                path: config_path.clone(),
                source,
            })?;

        let binary = resolve_binary(&self.config.binary);

        info!(
            binary = %binary.display(),
            config = %config_path.display(),
            working_dir = %self.config.working_dir.display(),
            "Starting proxy"
        );

        let mut cmd = Command::new(&binary);
        cmd.arg("-c").arg(&config_path);
        cmd.args(&self.config.extra_args);
        cmd.current_dir(&self.config.working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Own process group so stop can signal the whole tree at once
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let spawn_error = |source| StartError::Spawn {
            binary: binary.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child.id().ok_or_else(|| {
            spawn_error(std::io::Error::other("process exited before its pid was observed"))
        })?;

        let handle = ProcessHandle {
            pid,
            config_path,
            started_at: Utc::now(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(false);

        let generation = {
            let mut slot = self.slot.lock();
            slot.next_generation += 1;
            let generation = slot.next_generation;
            slot.instance = Some(Instance {
                handle: handle.clone(),
                generation,
                exit_rx,
                shutdown_tx,
            });
            slot.state = SupervisorState::Running;
            generation
        };

        info!(pid, "Proxy process spawned");
        self.emit(ProcessEvent::Started { pid });

        if let Some(stdout) = child.stdout.take() {
            self.spawn_output_reader(stdout, OutputStream::Stdout, pid, generation, shutdown_rx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_output_reader(stderr, OutputStream::Stderr, pid, generation, shutdown_rx);
        }
        self.spawn_exit_watcher(child, pid, generation, exit_tx);

        Ok(handle)
    }

    fn spawn_output_reader<R>(
        self: &Arc<Self>,
        reader: R,
        stream: OutputStream,
        pid: u32,
        generation: u64,
        mut shutdown_rx: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let supervisor = Arc::clone(self);

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if supervisor.handle_output_line(stream, pid, generation, line) {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!(pid, stream = stream.as_str(), error = %e, "Error reading proxy output");
                                break;
                            }
                        }
                    }
                }
            }

            debug!(pid, stream = stream.as_str(), "Output reader task exiting");
        });
    }

    /// Forward one output line. Returns true when the reader should stop.
    fn handle_output_line(&self, stream: OutputStream, pid: u32, generation: u64, line: String) -> bool {
        match stream {
            OutputStream::Stdout => {
                debug!(target: "proxy", pid, stream = "stdout", "{}", line);
                self.emit(ProcessEvent::Stdout { pid, line });
                false
            }
            OutputStream::Stderr => {
                warn!(target: "proxy", pid, stream = "stderr", "{}", line);
                self.emit(ProcessEvent::Stderr { pid, line });

                if self.config.stderr_policy == StderrPolicy::Fatal {
                    // The process is left alone; only our handle is dropped
                    self.clear(generation, ClearReason::ErrorOutput);
                    return true;
                }
                false
            }
        }
    }

    fn spawn_exit_watcher(
        self: &Arc<Self>,
        mut child: Child,
        pid: u32,
        generation: u64,
        exit_tx: watch::Sender<bool>,
    ) {
        let supervisor = Arc::clone(self);

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    info!(pid, ?status, "Proxy process exited");
                    status.code()
                }
                Err(e) => {
                    warn!(pid, error = %e, "Error waiting for proxy process");
                    None
                }
            };

            supervisor.emit(ProcessEvent::Exited { pid, code });
            let _ = exit_tx.send(true);

            // A stop in progress clears the handle itself once it sees the exit
            let stopping = {
                let slot = supervisor.slot.lock();
                slot.state == SupervisorState::Stopping
                    && slot.instance.as_ref().map(|i| i.generation) == Some(generation)
            };
            if !stopping {
                supervisor.clear(generation, ClearReason::Exited);
            }
        });
    }

    /// Drop the handle of `generation` if it is still the current one
    fn clear(&self, generation: u64, reason: ClearReason) -> bool {
        let instance = {
            let mut slot = self.slot.lock();
            match slot.instance {
                Some(ref instance) if instance.generation == generation => {}
                _ => return false,
            }
            slot.state = SupervisorState::Idle;
            slot.instance.take()
        };

        let Some(instance) = instance else {
            return false;
        };

        let _ = instance.shutdown_tx.send(true);
        let pid = instance.handle.pid;
        info!(pid, ?reason, "Proxy handle cleared");
        self.emit(ProcessEvent::Cleared { pid, reason });
        true
    }

    /// Kill the proxy and all its descendants, then wait for the exit.
    ///
    /// Waiting is bounded by the configured stop timeout; once it elapses the
    /// stop still succeeds because the kill was already delivered to the tree.
    pub async fn stop(&self) -> Result<(), StopError> {
        let _guard = self.lifecycle.lock().await;

        let (pid, generation, mut exit_rx) = {
            let mut slot = self.slot.lock();
            let Some(ref instance) = slot.instance else {
                debug!("Stop requested but proxy is not running");
                return Err(StopError::NotRunning);
            };
            let info = (instance.handle.pid, instance.generation, instance.exit_rx.clone());
            slot.state = SupervisorState::Stopping;
            info
        };

        info!(pid, "Killing proxy process tree");

        #[cfg(unix)]
        let terminated = terminate_tree(pid, self.stop_signal).await;
        #[cfg(not(unix))]
        let terminated = terminate_tree(pid).await;

        if let Err(source) = terminated {
            error!(pid, error = %source, "Failed to deliver kill signal to proxy");
            self.clear(generation, ClearReason::TerminationFailed);
            return Err(StopError::Termination { pid, source });
        }

        let timeout = self.config.stop_timeout();
        match tokio::time::timeout(timeout, exit_rx.wait_for(|exited| *exited)).await {
            Ok(_) => debug!(pid, "Proxy exit observed"),
            Err(_) => warn!(
                pid,
                timeout_secs = timeout.as_secs(),
                "Proxy exit not observed within stop timeout, kill was already delivered"
            ),
        }

        self.clear(generation, ClearReason::Stopped);
        Ok(())
    }
}

/// Relative paths with a directory part are taken relative to our own working
/// directory, not the proxy's; bare names go through `PATH`.
fn resolve_binary(binary: &Path) -> PathBuf {
    if binary.is_relative() && binary.components().count() > 1 {
        absolutize(binary)
    } else {
        binary.to_path_buf()
    }
}

async fn write_config(path: &Path, text: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, text).await
}

/// Send `signal` to the process group led by `pid`
#[cfg(unix)]
async fn terminate_tree(pid: u32, signal: i32) -> std::io::Result<()> {
    let pgid = i32::try_from(pid).map_err(std::io::Error::other)?;
    let result = unsafe { libc::kill(-pgid, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Force-kill `pid` and its descendants
#[cfg(not(unix))]
async fn terminate_tree(pid: u32) -> std::io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;

    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config(dir: &Path) -> ProxyConfig {
        ProxyConfig {
            binary: dir.join("no-such-proxy"),
            working_dir: dir.to_path_buf(),
            config_path: dir.join("conf").join("nginx.tmp.conf"),
            access_log: dir.join("logs").join("json.log"),
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn test_initial_state_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProxySupervisor::new(unreachable_config(dir.path()));

        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(!supervisor.status());
        assert!(supervisor.pid().is_none());
        assert!(supervisor.handle().is_none());
    }

    #[test]
    fn test_resolve_binary() {
        assert_eq!(resolve_binary(Path::new("nginx")), PathBuf::from("nginx"));
        assert_eq!(resolve_binary(Path::new("/usr/sbin/nginx")), PathBuf::from("/usr/sbin/nginx"));

        let resolved = resolve_binary(Path::new("nginx/nginx"));
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("nginx/nginx"));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SupervisorState::Running).unwrap(), "\"running\"");
        assert_eq!(serde_json::to_string(&ClearReason::ErrorOutput).unwrap(), "\"error_output\"");
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProxySupervisor::new(unreachable_config(dir.path()));

        let result = supervisor.stop().await;
        assert!(matches!(result, Err(StopError::NotRunning)));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_spawn_failure_reverts_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProxySupervisor::new(unreachable_config(dir.path()));

        let result = supervisor.start("events {}\n").await;
        assert!(matches!(result, Err(StartError::Spawn { .. })));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(!supervisor.status());

        // The config was still written before the spawn attempt
        let written = std::fs::read_to_string(dir.path().join("conf/nginx.tmp.conf")).unwrap();
        assert_eq!(written, "events {}\n");
    }

    #[tokio::test]
    async fn test_config_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let mut config = unreachable_config(dir.path());
        config.config_path = blocker.join("nginx.tmp.conf");
        let supervisor = ProxySupervisor::new(config);

        let result = supervisor.start("events {}\n").await;
        assert!(matches!(result, Err(StartError::WriteConfig { .. })));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }
}
