use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::fleet::logs::LogConfig;
use crate::fleet::queue::QueueConfig;
use crate::fleet::rate_limit::RateLimitConfig;
use crate::fleet::sandbox::SandboxConfig;

/// HTTP/WebSocket listener and process-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Frames buffered per WebSocket connection before new ones are dropped.
    pub outbound_buffer: usize,
    /// How long shutdown waits for active jobs.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3150,
            db_path: PathBuf::from(".fleet/fleet.db"),
            outbound_buffer: 256,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub logs: LogConfig,
    pub sandbox: SandboxConfig,
}

/// Raw TOML structure for `.fleet/fleet.toml`
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FleetToml {
    server: Option<ServerSection>,
    queue: Option<QueueSection>,
    rate_limit: Option<RateLimitSection>,
    logs: Option<LogsSection>,
    sandbox: Option<SandboxSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    outbound_buffer: Option<usize>,
    shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct QueueSection {
    max_waiting: Option<usize>,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    keep_completed: Option<usize>,
    keep_failed: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RateLimitSection {
    window_ms: Option<u64>,
    block_duration_ms: Option<u64>,
    read: Option<u32>,
    write: Option<u32>,
    critical: Option<u32>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LogsSection {
    ingest_per_second: Option<u32>,
    ring_capacity: Option<usize>,
    batch_interval_ms: Option<u64>,
    retention_hours: Option<u64>,
    sweep_interval_secs: Option<u64>,
    recent_default: Option<usize>,
    history_page_max: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    enabled: Option<bool>,
    agent_command: Option<Vec<String>>,
    working_dir: Option<String>,
    timeout_secs: Option<u64>,
    kill_grace_secs: Option<u64>,
    max_output_bytes: Option<usize>,
    metrics_interval_ms: Option<u64>,
}

impl FleetConfig {
    /// Path of the config file inside a config directory.
    pub fn file_path(config_dir: &Path) -> PathBuf {
        config_dir.join("fleet.toml")
    }

    /// Load `fleet.toml` from `config_dir` (usually `.fleet`). Returns
    /// defaults if the file doesn't exist.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_path = Self::file_path(config_dir);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let raw: FleetToml = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(s) = raw.server {
            let server = &mut config.server;
            if let Some(host) = s.host {
                server.host = host;
            }
            if let Some(port) = s.port {
                server.port = port;
            }
            if let Some(db_path) = s.db_path {
                server.db_path = db_path;
            }
            if let Some(n) = s.outbound_buffer {
                server.outbound_buffer = n;
            }
            if let Some(secs) = s.shutdown_grace_secs {
                server.shutdown_grace = Duration::from_secs(secs);
            }
        }

        if let Some(s) = raw.queue {
            let queue = &mut config.queue;
            if let Some(n) = s.max_waiting {
                queue.max_waiting = n;
            }
            if let Some(n) = s.max_attempts {
                anyhow::ensure!(n > 0, "queue.max_attempts must be at least 1");
                queue.max_attempts = n;
            }
            if let Some(ms) = s.backoff_base_ms {
                queue.backoff_base = Duration::from_millis(ms);
            }
            if let Some(n) = s.keep_completed {
                queue.keep_completed = n;
            }
            if let Some(n) = s.keep_failed {
                queue.keep_failed = n;
            }
        }

        if let Some(s) = raw.rate_limit {
            let limits = &mut config.rate_limit;
            if let Some(ms) = s.window_ms {
                limits.window = Duration::from_millis(ms);
            }
            if let Some(ms) = s.block_duration_ms {
                limits.block_duration = Duration::from_millis(ms);
            }
            if let Some(n) = s.read {
                limits.read_limit = n;
            }
            if let Some(n) = s.write {
                limits.write_limit = n;
            }
            if let Some(n) = s.critical {
                limits.critical_limit = n;
            }
            if let Some(secs) = s.sweep_interval_secs {
                limits.sweep_interval = Duration::from_secs(secs);
            }
        }

        if let Some(s) = raw.logs {
            let logs = &mut config.logs;
            if let Some(n) = s.ingest_per_second {
                logs.ingest_per_second = n;
            }
            if let Some(n) = s.ring_capacity {
                logs.ring_capacity = n;
            }
            if let Some(ms) = s.batch_interval_ms {
                logs.batch_interval = Duration::from_millis(ms);
            }
            if let Some(hours) = s.retention_hours {
                logs.retention = Duration::from_secs(hours * 60 * 60);
            }
            if let Some(secs) = s.sweep_interval_secs {
                logs.sweep_interval = Duration::from_secs(secs);
            }
            if let Some(n) = s.recent_default {
                logs.recent_default = n;
            }
            if let Some(n) = s.history_page_max {
                logs.history_page_max = n;
            }
        }

        if let Some(s) = raw.sandbox {
            let sandbox = &mut config.sandbox;
            if let Some(enabled) = s.enabled {
                sandbox.enabled = enabled;
            }
            if let Some(cmd) = s.agent_command {
                anyhow::ensure!(!cmd.is_empty(), "sandbox.agent_command must not be empty");
                sandbox.agent_command = cmd;
            }
            if let Some(dir) = s.working_dir {
                sandbox.working_dir = Some(dir);
            }
            if let Some(secs) = s.timeout_secs {
                sandbox.timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = s.kill_grace_secs {
                sandbox.kill_grace = Duration::from_secs(secs);
            }
            if let Some(n) = s.max_output_bytes {
                sandbox.max_output_bytes = n;
            }
            if let Some(ms) = s.metrics_interval_ms {
                sandbox.metrics_interval = Duration::from_millis(ms);
            }
        }

        Ok(config)
    }

    /// A commented example file with every default spelled out.
    pub fn template() -> &'static str {
        r#"[server]
host = "127.0.0.1"
port = 3150
db_path = ".fleet/fleet.db"
outbound_buffer = 256
shutdown_grace_secs = 30

[queue]
max_waiting = 100
max_attempts = 3
backoff_base_ms = 5000
keep_completed = 100
keep_failed = 500

[rate_limit]
window_ms = 60000
block_duration_ms = 60000
read = 60
write = 10
critical = 3
sweep_interval_secs = 300

[logs]
ingest_per_second = 100
ring_capacity = 200
batch_interval_ms = 500
retention_hours = 24
sweep_interval_secs = 1800

[sandbox]
enabled = true
# Instruction text is appended as the last argument.
agent_command = ["claude", "--print"]
timeout_secs = 1800
kill_grace_secs = 10
metrics_interval_ms = 2000
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = FleetConfig::load(dir.path()).unwrap();
        assert_eq!(config.server.port, 3150);
        assert_eq!(config.queue.max_waiting, 100);
        assert_eq!(config.queue.backoff_base, Duration::from_secs(5));
        assert_eq!(config.rate_limit.critical_limit, 3);
        assert_eq!(config.logs.ingest_per_second, 100);
        assert_eq!(config.logs.sweep_interval, Duration::from_secs(1800));
    }

    #[test]
    fn test_load_partial_sections_merge_over_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("fleet.toml"),
            r#"
[queue]
max_waiting = 5

[rate_limit]
write = 2

[sandbox]
agent_command = ["codex", "exec"]
timeout_secs = 60
"#,
        )
        .unwrap();
        let config = FleetConfig::load(dir.path()).unwrap();
        assert_eq!(config.queue.max_waiting, 5);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.rate_limit.write_limit, 2);
        assert_eq!(config.rate_limit.read_limit, 60);
        assert_eq!(config.sandbox.agent_command, vec!["codex", "exec"]);
        assert_eq!(config.sandbox.timeout, Duration::from_secs(60));
        assert_eq!(config.server.outbound_buffer, 256);
    }

    #[test]
    fn test_load_invalid_toml_is_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("fleet.toml"), "[queue\nmax_waiting = ").unwrap();
        let err = FleetConfig::load(dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse"));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        assert!(FleetConfig::parse("[queue]\nmax_attempts = 0\n").is_err());
    }

    #[test]
    fn test_unknown_section_rejected() {
        assert!(FleetConfig::parse("[queues]\nmax_waiting = 1\n").is_err());
    }

    #[test]
    fn test_template_parses_to_defaults() {
        let config = FleetConfig::parse(FleetConfig::template()).unwrap();
        let defaults = FleetConfig::default();
        assert_eq!(config.server.port, defaults.server.port);
        assert_eq!(config.queue.backoff_base, defaults.queue.backoff_base);
        assert_eq!(config.logs.retention, defaults.logs.retention);
        assert_eq!(config.sandbox.metrics_interval, defaults.sandbox.metrics_interval);
    }
}
