use proxyvisor::api::{ControlApi, PKG_NAME, VERSION};
use proxyvisor::config::Config;
use proxyvisor::service::ControlService;
use proxyvisor::store::SqliteStore;
use proxyvisor::supervisor::ProxySupervisor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "proxyvisor.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxyvisor=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_arg = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_arg.as_deref())?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Arc::new(SqliteStore::open(&config.store.path).map_err(|e| {
        error!(path = %config.store.path.display(), error = %e, "Failed to open server store");
        e
    })?);
    info!(path = %config.store.path.display(), "Server store opened");

    let supervisor = ProxySupervisor::new(config.proxy.clone());
    let service = Arc::new(ControlService::new(store, Arc::clone(&supervisor)));
    let monitor_handle = service.spawn_event_monitor(shutdown_rx.clone());

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid control API bind address");
            anyhow::anyhow!("Invalid control API bind address: {}", e)
        })?;

    let api = ControlApi::new(bind_addr, Arc::clone(&service), shutdown_rx.clone());
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "Control API error");
        }
    });

    if config.proxy.start_on_boot {
        let report = service.start_servers().await;
        if report.is_success() {
            info!(message = %report.message, "Proxy started on boot");
        } else {
            warn!(message = %report.message, "Proxy failed to start on boot");
        }
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    if let Some(report) = service.stop_servers().await {
        info!(message = %report.message, status = ?report.status, "Proxy stopped");
    }

    // Wait for the API and the event monitor to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = api_handle.await;
        let _ = monitor_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration from `path`, or from the default location if none was given.
///
/// Only a missing default file falls back to built-in defaults; an explicitly
/// named file must exist.
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    if !explicit && !path.exists() {
        warn!(path = %path.display(), "Configuration file not found, using defaults");
        return Ok(Config::default());
    }

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy control service");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        store = %config.store.path.display(),
        "Control API configuration"
    );
    info!(
        binary = %config.proxy.binary.display(),
        working_dir = %config.proxy.working_dir.display(),
        config_path = %config.proxy.config_path.display(),
        access_log = %config.proxy.access_log.display(),
        stderr_policy = ?config.proxy.stderr_policy,
        stop_timeout_secs = config.proxy.stop_timeout_secs,
        start_on_boot = config.proxy.start_on_boot,
        "Proxy settings"
    );
}
