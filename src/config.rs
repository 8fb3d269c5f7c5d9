use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the control service
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Control API listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Supervised proxy process
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Server record store
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Control API port (default: 8090)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

/// What the supervisor does with output on the proxy's error stream
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StderrPolicy {
    /// Any stderr output clears the process handle.
    ///
    /// nginx writes warnings to stderr too, so this is noisy: a harmless
    /// warning makes the proxy look stopped while it keeps running.
    #[default]
    Fatal,
    /// Stderr is only logged; liveness follows the process exit status.
    Log,
}

/// Launch parameters for the proxy binary
///
/// # Security Warning
///
/// `binary` and `extra_args` are executed directly. Protect the configuration
/// file; it is never populated from API requests.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Proxy executable (default: nginx/nginx)
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Working directory the proxy is started in (default: .)
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Where the rendered configuration is written before every start
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Structured access log written by the proxy (NDJSON)
    #[serde(default = "default_access_log")]
    pub access_log: PathBuf,

    /// Arguments appended after `-c <config_path>`
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// How long `stop` waits for the exit notification after the kill
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Treatment of the proxy's error stream
    #[serde(default)]
    pub stderr_policy: StderrPolicy,

    /// Start the proxy as soon as the control API is up
    #[serde(default)]
    pub start_on_boot: bool,
}

impl ProxyConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Validate the launch parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.binary.as_os_str().is_empty() {
            return Err("proxy.binary must not be empty".to_string());
        }
        if self.config_path.as_os_str().is_empty() {
            return Err("proxy.config_path must not be empty".to_string());
        }
        if self.access_log.as_os_str().is_empty() {
            return Err("proxy.access_log must not be empty".to_string());
        }
        if self.stop_timeout_secs == 0 {
            return Err("proxy.stop_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            working_dir: default_working_dir(),
            config_path: default_config_path(),
            access_log: default_access_log(),
            extra_args: Vec::new(),
            stop_timeout_secs: default_stop_timeout(),
            stderr_policy: StderrPolicy::default(),
            start_on_boot: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database holding server records
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8090
}

fn default_binary() -> PathBuf {
    PathBuf::from("nginx/nginx")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("nginx/conf/nginx.tmp.conf")
}

fn default_access_log() -> PathBuf {
    PathBuf::from("logs/json.log")
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/servers.db")
}

/// Resolve `path` against the current working directory if it is relative
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.bind.is_empty() {
            errors.push("server.bind must not be empty".to_string());
        }
        if let Err(e) = self.proxy.validate() {
            errors.push(e);
        }
        if self.store.path.as_os_str().is_empty() {
            errors.push("store.path must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
