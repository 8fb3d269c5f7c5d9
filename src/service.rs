//! Control operations exposed to the API
//!
//! Orchestrates the store, the renderer and the supervisor, and turns
//! supervisor outcomes into [`ControlReport`]s so failures never escape to the
//! request path as errors.

use crate::error::{ServiceError, StartError, StopError};
use crate::render::ConfigRenderer;
use crate::store::{ServerRecord, ServerStore};
use crate::supervisor::{ClearReason, ProcessEvent, ProcessHandle, ProxySupervisor, SupervisorState};
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default number of access-log entries returned
pub const DEFAULT_LOG_LIMIT: usize = 1000;

/// Outcome of a start/stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Error,
}

/// Uniform result envelope for start/stop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReport {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub status: ReportStatus,
}

impl ControlReport {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            status: ReportStatus::Success,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            status: ReportStatus::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }
}

/// One line of the proxy's JSON access log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLogEntry {
    pub remote_addr: String,
    pub remote_user: String,
    pub time_local: String,
    pub proxy_host: String,
    pub request: String,
    pub status: String,
    pub body_bytes_sent: String,
    pub http_referrer: String,
    pub http_user_agent: String,
}

/// How the most recent proxy instance ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastStop {
    pub pid: u32,
    pub reason: ClearReason,
    /// `None` when killed by a signal or when the exit was never observed
    pub exit_code: Option<i32>,
    pub at: DateTime<Utc>,
}

/// Snapshot of the supervisor for status queries
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub state: SupervisorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stop: Option<LastStop>,
}

/// Orchestrates record storage, config rendering and the proxy process
pub struct ControlService {
    store: Arc<dyn ServerStore>,
    renderer: ConfigRenderer,
    supervisor: Arc<ProxySupervisor>,
    access_log: PathBuf,
    last_stop: Arc<Mutex<Option<LastStop>>>,
}

impl ControlService {
    /// The access log location is taken from the supervisor's config and is
    /// also rendered into the proxy configuration.
    pub fn new(store: Arc<dyn ServerStore>, supervisor: Arc<ProxySupervisor>) -> Self {
        let access_log = crate::config::absolutize(&supervisor.config().access_log);
        Self {
            store,
            renderer: ConfigRenderer::new().with_access_log(&access_log),
            supervisor,
            access_log,
            last_stop: Arc::new(Mutex::new(None)),
        }
    }

    pub fn supervisor(&self) -> &Arc<ProxySupervisor> {
        &self.supervisor
    }

    pub fn access_log_path(&self) -> &Path {
        &self.access_log
    }

    /// Follow proxy lifecycle events until shutdown.
    ///
    /// Logs every stop the service did not ask for and remembers the most
    /// recent stop for [`status`](Self::status). Events are subscribed to
    /// before this returns, so a start issued afterwards is never missed.
    pub fn spawn_event_monitor(&self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self.supervisor.subscribe();
        let last_stop = Arc::clone(&self.last_stop);

        tokio::spawn(async move {
            let mut last_exit: Option<(u32, Option<i32>)> = None;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(ProcessEvent::Exited { pid, code }) => {
                                last_exit = Some((pid, code));
                            }
                            Ok(ProcessEvent::Cleared { pid, reason }) => {
                                let exit_code = match last_exit.take() {
                                    Some((exited, code)) if exited == pid => code,
                                    _ => None,
                                };
                                if reason == ClearReason::Stopped {
                                    info!(pid, "Proxy stopped on request");
                                } else {
                                    warn!(pid, ?reason, exit_code, "Proxy stopped unexpectedly");
                                }
                                *last_stop.lock() = Some(LastStop {
                                    pid,
                                    reason,
                                    exit_code,
                                    at: Utc::now(),
                                });
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Event monitor fell behind proxy events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }

            debug!("Event monitor exiting");
        })
    }

    // ==================== Process control ====================

    /// Render all enabled records and start the proxy with them
    pub async fn start_servers(&self) -> ControlReport {
        let records = match self.store.list() {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to read server records");
                return ControlReport::error(format!("Error starting server : {e:#}"));
            }
        };

        let enabled: Vec<ServerRecord> = records.into_iter().filter(|r| r.enable).collect();
        let config_text = self.renderer.render(&enabled);

        match self.supervisor.start(&config_text).await {
            Ok(handle) => {
                let names = enabled
                    .iter()
                    .map(|r| r.display_name.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                info!(pid = handle.pid, servers = %names, "Proxy started");
                ControlReport::success(format!("Started servers : {names}"))
            }
            Err(StartError::AlreadyRunning { pid }) => {
                warn!(pid, "Start requested while proxy is already running");
                ControlReport::error("proxy is already running")
            }
            Err(e) => ControlReport::error(format!("Error starting server : {e}")),
        }
    }

    /// Stop the proxy. `None` means there was nothing to stop.
    pub async fn stop_servers(&self) -> Option<ControlReport> {
        match self.supervisor.stop().await {
            Ok(()) => Some(ControlReport::success("Killed proxy")),
            Err(StopError::NotRunning) => {
                debug!("Stop requested while proxy is not running");
                None
            }
            Err(e) => Some(ControlReport::error(format!("Error stopping proxy : {e}"))),
        }
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.status()
    }

    pub fn status(&self) -> ProxyStatus {
        ProxyStatus {
            state: self.supervisor.state(),
            process: self.supervisor.handle(),
            last_stop: self.last_stop.lock().clone(),
        }
    }

    /// Up to `max_entries` access-log entries, most recent first.
    ///
    /// A missing log file yields no entries. Lines are decoded lossily since the
    /// proxy copies raw request bytes into the log; lines that are still not
    /// valid JSON (e.g. a line still being written) are skipped.
    pub async fn fetch_recent_log(&self, max_entries: usize) -> anyhow::Result<Vec<AccessLogEntry>> {
        let content = match tokio::fs::read(&self.access_log).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.access_log.display(), "Access log does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read access log {}", self.access_log.display())
                })
            }
        };

        let entries = content
            .split(|b| *b == b'\n')
            .rev()
            .map(String::from_utf8_lossy)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<AccessLogEntry>(line.trim_end()) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(error = %e, "Skipping malformed access log line");
                    None
                }
            })
            .take(max_entries)
            .collect();

        Ok(entries)
    }

    // ==================== Records ====================

    pub fn list_servers(&self) -> Result<Vec<ServerRecord>, ServiceError> {
        Ok(self.store.list()?)
    }

    pub fn get_server(&self, id: i64) -> Result<ServerRecord, ServiceError> {
        self.store.get(id)?.ok_or(ServiceError::NotFound(id))
    }

    /// Save every record and return the full record list
    pub fn create_servers(&self, records: Vec<ServerRecord>) -> Result<Vec<ServerRecord>, ServiceError> {
        for record in &records {
            let saved = self.store.upsert(record)?;
            info!(id = ?saved.id, display_name = %saved.display_name, "Server saved");
        }
        self.list_servers()
    }

    /// Overwrite record `id`. The record must carry the same id.
    pub fn replace_server(&self, id: i64, record: ServerRecord) -> Result<ServerRecord, ServiceError> {
        if record.id != Some(id) {
            warn!(target_id = id, body_id = ?record.id, "Rejected server update with mismatched id");
            return Err(ServiceError::IdMismatch {
                target_id: id,
                body_id: record.id,
            });
        }

        let saved = self.store.upsert(&record)?;
        info!(id, display_name = %saved.display_name, "Server replaced");
        Ok(saved)
    }

    /// Delete record `id` if present and return the remaining records
    pub fn delete_server(&self, id: i64) -> Result<Vec<ServerRecord>, ServiceError> {
        if self.store.remove(id)? {
            info!(id, "Server deleted");
        } else {
            debug!(id, "Delete requested for unknown server");
        }
        self.list_servers()
    }
}
