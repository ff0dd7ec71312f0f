use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = "config/strategos.toml";

const DEFAULT_MAX_STEPS: usize = 16;
const DEFAULT_MAX_DURATION_SECS: u64 = 300;
const DEFAULT_COMPLETION_THRESHOLD: f64 = 0.8;
const DEFAULT_CONSOLIDATE_EVERY: usize = 5;
const DEFAULT_MAX_CONCURRENT_TOOLS: usize = 3;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RECONNECTS: u32 = 3;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Launch description for an out-of-process tool server reached over stdio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub max_duration: Duration,
    pub completion_threshold: f64,
    pub consolidate_every: usize,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_concurrent_tools: usize,
    pub tool_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub request_timeout: Duration,
    pub max_reconnects: u32,
    pub reconnect_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub dispatch: DispatchConfig,
    pub protocol: ProtocolConfig,
    pub servers: Vec<ServerConfig>,
    pub allow_tools: Vec<String>,
    pub block_tools: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    agent: RawAgent,
    #[serde(default)]
    dispatch: RawDispatch,
    #[serde(default)]
    protocol: RawProtocol,
    #[serde(default)]
    servers: Vec<ServerConfig>,
    #[serde(default)]
    allow_tools: Vec<String>,
    #[serde(default)]
    block_tools: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawAgent {
    max_steps: Option<usize>,
    max_duration_secs: Option<u64>,
    completion_threshold: Option<f64>,
    consolidate_every: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RawDispatch {
    max_concurrent_tools: Option<usize>,
    tool_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawProtocol {
    request_timeout_secs: Option<u64>,
    max_reconnects: Option<u32>,
    reconnect_backoff_ms: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_duration: Duration::from_secs(DEFAULT_MAX_DURATION_SECS),
            completion_threshold: DEFAULT_COMPLETION_THRESHOLD,
            consolidate_every: DEFAULT_CONSOLIDATE_EVERY,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tools: DEFAULT_MAX_CONCURRENT_TOOLS,
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            dispatch: DispatchConfig::default(),
            protocol: ProtocolConfig::default(),
            servers: Vec::new(),
            allow_tools: Vec::new(),
            block_tools: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(AppConfig {
        agent: AgentConfig {
            max_steps: parsed.agent.max_steps.unwrap_or(DEFAULT_MAX_STEPS),
            max_duration: Duration::from_secs(
                parsed
                    .agent
                    .max_duration_secs
                    .unwrap_or(DEFAULT_MAX_DURATION_SECS),
            ),
            completion_threshold: parsed
                .agent
                .completion_threshold
                .unwrap_or(DEFAULT_COMPLETION_THRESHOLD),
            consolidate_every: parsed
                .agent
                .consolidate_every
                .unwrap_or(DEFAULT_CONSOLIDATE_EVERY),
        },
        dispatch: DispatchConfig {
            max_concurrent_tools: parsed
                .dispatch
                .max_concurrent_tools
                .unwrap_or(DEFAULT_MAX_CONCURRENT_TOOLS),
            tool_timeout: Duration::from_secs(
                parsed
                    .dispatch
                    .tool_timeout_secs
                    .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS),
            ),
        },
        protocol: ProtocolConfig {
            request_timeout: Duration::from_secs(
                parsed
                    .protocol
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            max_reconnects: parsed
                .protocol
                .max_reconnects
                .unwrap_or(DEFAULT_MAX_RECONNECTS),
            reconnect_backoff: Duration::from_millis(
                parsed
                    .protocol
                    .reconnect_backoff_ms
                    .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS),
            ),
        },
        servers: parsed.servers,
        allow_tools: parsed.allow_tools,
        block_tools: parsed.block_tools,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_defaults_for_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("strategos.toml");
        fs::write(&path, "").expect("write");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.agent.max_steps, DEFAULT_MAX_STEPS);
        assert_eq!(config.dispatch.max_concurrent_tools, 3);
        assert!(config.servers.is_empty());
        assert!(config.allow_tools.is_empty());
    }

    #[test]
    fn reads_budgets_and_thresholds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("strategos.toml");
        fs::write(
            &path,
            r#"
[agent]
max_steps = 4
max_duration_secs = 60
completion_threshold = 0.9

[dispatch]
max_concurrent_tools = 2
tool_timeout_secs = 5
"#,
        )
        .expect("write");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.agent.max_steps, 4);
        assert_eq!(config.agent.max_duration, Duration::from_secs(60));
        assert!((config.agent.completion_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.dispatch.max_concurrent_tools, 2);
        assert_eq!(config.dispatch.tool_timeout, Duration::from_secs(5));
    }

    #[test]
    fn reads_server_definitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("strategos.toml");
        fs::write(
            &path,
            r#"
allow_tools = ["read_file"]

[[servers]]
name = "files"
command = "file-server"
args = ["--root", "/tmp"]

[[servers]]
name = "search"
command = "search-server"
"#,
        )
        .expect("write");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].name, "files");
        assert_eq!(config.servers[0].args, vec!["--root", "/tmp"]);
        assert_eq!(config.servers[1].command, "search-server");
        assert_eq!(config.allow_tools, vec!["read_file"]);
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("strategos.toml");
        fs::write(&path, "[agent\nmax_steps = 4").expect("write");

        let result = AppConfig::load(Some(&path));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
