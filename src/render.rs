//! Proxy configuration rendering
//!
//! Produces a complete nginx configuration from the enabled server records.
//! Fragments are opaque: they are copied verbatim and never validated.

use crate::store::ServerRecord;
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Name of the structured log format declared in the preamble
pub const LOG_FORMAT_NAME: &str = "json_logs";

const EVENTS_BLOCK: &str = "events {\n    worker_connections  1024;\n}\n";

const HTTP_PREAMBLE: &str = "    include       mime.types;
    default_type  application/octet-stream;

    sendfile        on;

    keepalive_timeout  65;
";

const LOG_FORMAT: &str = r#"    log_format json_logs escape=json '{"remote_addr":"$remote_addr", "remote_user":"$remote_user", "time_local":"$time_local", '
                       '"proxy_host":"$proxy_host", "request":"$request", "status":"$status", "body_bytes_sent":"$body_bytes_sent", '
                       '"http_referrer":"$http_referer", "http_user_agent":"$http_user_agent"}';
"#;

/// Renders server records into a proxy configuration file
#[derive(Debug, Clone, Default)]
pub struct ConfigRenderer {
    access_log: Option<PathBuf>,
}

impl ConfigRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an `access_log` directive using the JSON log format
    pub fn with_access_log(mut self, path: impl AsRef<Path>) -> Self {
        self.access_log = Some(path.as_ref().to_path_buf());
        self
    }

    /// Render the configuration for `records`, in the given order.
    ///
    /// Callers pass only enabled records; this function does not filter.
    pub fn render(&self, records: &[ServerRecord]) -> String {
        let mut out = String::with_capacity(1024);

        out.push_str(EVENTS_BLOCK);
        out.push_str("\nhttp {\n");
        out.push_str(HTTP_PREAMBLE);
        out.push_str(LOG_FORMAT);

        if let Some(ref path) = self.access_log {
            // Writing to a String cannot fail
            let _ = writeln!(
                out,
                "    access_log {} {};",
                quote_argument(&path.to_string_lossy()),
                LOG_FORMAT_NAME
            );
        }

        let body = records
            .iter()
            .map(|r| r.conf.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !body.is_empty() {
            out.push('\n');
            out.push_str(&body);
            out.push('\n');
        }

        out.push_str("}\n");
        out
    }
}

/// Double-quote a directive argument so spaces and `;` stay inside it
fn quote_argument(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
