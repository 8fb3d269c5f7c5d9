//! Shared helpers for tests that run a stand-in proxy process

use crate::config::{ProxyConfig, StderrPolicy};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Config text containing this makes the fake proxy write a line to stderr
pub const STDERR_MARKER: &str = "fake-proxy:stderr";

/// Config text containing this makes the fake proxy exit with status 3
pub const EXIT_MARKER: &str = "fake-proxy:exit";

// Invoked as `fake-proxy -c <config>`. Leaves a background child so tree
// termination can be observed, and records its pid next to the config.
const FAKE_PROXY: &str = r#"#!/bin/sh
conf="$2"
if grep -q 'fake-proxy:exit' "$conf"; then
    exit 3
fi
sleep 60 &
echo $! > "$(dirname "$conf")/child.pid"
echo "fake proxy running"
if grep -q 'fake-proxy:stderr' "$conf"; then
    echo "nginx: [warn] fake warning" >&2
fi
wait
"#;

static FAKE_PROXY_DIR: OnceLock<tempfile::TempDir> = OnceLock::new();

/// Path of the fake proxy script.
///
/// Written once per test binary, before any test spawns it, so no concurrently
/// forked child can hold the file open for writing when it is executed.
pub fn fake_proxy_binary() -> PathBuf {
    let dir = FAKE_PROXY_DIR.get_or_init(|| {
        let dir = tempfile::tempdir().expect("create fake proxy dir");
        let path = dir.path().join("fake-proxy");
        std::fs::write(&path, FAKE_PROXY).expect("write fake proxy");
        let mut perms = std::fs::metadata(&path).expect("stat fake proxy").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod fake proxy");
        dir
    });
    dir.path().join("fake-proxy")
}

/// Proxy settings that run the fake proxy inside `dir`
pub fn fake_proxy_config(dir: &Path, stderr_policy: StderrPolicy) -> ProxyConfig {
    ProxyConfig {
        binary: fake_proxy_binary(),
        working_dir: dir.to_path_buf(),
        config_path: dir.join("conf").join("nginx.tmp.conf"),
        access_log: dir.join("logs").join("json.log"),
        extra_args: Vec::new(),
        stop_timeout_secs: 5,
        stderr_policy,
        start_on_boot: false,
    }
}

/// Wait for the fake proxy to record the pid of its background child
pub async fn read_child_pid(dir: &Path, timeout: Duration) -> u32 {
    let path = dir.join("conf").join("child.pid");
    let start = std::time::Instant::now();
    loop {
        if let Some(pid) = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            return pid;
        }
        assert!(start.elapsed() < timeout, "fake proxy never wrote {}", path.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// True if `pid` exists and is not a zombie
pub fn process_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as i32, 0) } != 0 {
        return false;
    }

    #[cfg(target_os = "linux")]
    {
        // The state letter follows the parenthesized command name
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            if let Some(state) = stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.trim_start().chars().next())
            {
                return state != 'Z';
            }
        }
    }

    true
}
