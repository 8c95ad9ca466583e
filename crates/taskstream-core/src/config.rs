use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What to do when a start request arrives for a task that is still running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Signal the running instance to take another turn with the new prompt.
    #[default]
    Continue,
    /// Terminate the running instance and start over.
    Restart,
}

impl ConflictPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "continue" | "signal" => Some(ConflictPolicy::Continue),
            "restart" | "terminate" => Some(ConflictPolicy::Restart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    /// NDJSON file replayed by the scripted agent when no command is set.
    pub script: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            script: None,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_secs: u64,
    pub sink_capacity: usize,
    pub replay_pacing_ms: u64,
    pub settle_delay_ms: u64,
    pub conflict_policy: ConflictPolicy,
    pub restart_grace_ms: u64,
    pub publish_max_attempts: u32,
    pub publish_backoff_ms: u64,
    pub agent: AgentConfig,
    pub logs_dir: Option<PathBuf>,
    pub log_retention_days: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            heartbeat_secs: 30,
            sink_capacity: 64,
            replay_pacing_ms: 100,
            settle_delay_ms: 1000,
            conflict_policy: ConflictPolicy::Continue,
            restart_grace_ms: 1000,
            publish_max_attempts: 3,
            publish_backoff_ms: 200,
            agent: AgentConfig::default(),
            logs_dir: None,
            log_retention_days: 14,
        }
    }
}

impl ServerConfig {
    /// defaults < file < process environment < cli
    pub fn resolve(file: Option<&Path>, cli: Value) -> Result<Self, ConfigError> {
        Self::resolve_with(file, |key| std::env::var(key).ok(), cli)
    }

    pub fn resolve_with(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
        cli: Value,
    ) -> Result<Self, ConfigError> {
        let mut merged = serde_json::to_value(Self::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(path) = file {
            deep_merge(&mut merged, &read_json_file(path)?);
        }
        deep_merge(&mut merged, &env_layer(env));
        deep_merge(&mut merged, &cli);
        let config: ServerConfig =
            serde_json::from_value(merged).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "publish_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.agent.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "agent.timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn replay_pacing(&self) -> Duration {
        Duration::from_millis(self.replay_pacing_ms)
    }

    /// Delay between a client's stream open and its recovery request.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn publish_backoff(&self) -> Duration {
        Duration::from_millis(self.publish_backoff_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    pub fn logs_dir_or(&self, state_dir: &Path) -> PathBuf {
        self.logs_dir
            .clone()
            .unwrap_or_else(|| taskstream_observability::canonical_logs_dir_from_root(state_dir))
    }
}

pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("taskstream"))
        .unwrap_or_else(|| PathBuf::from(".taskstream"))
}

fn read_json_file(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(json!({}));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_layer(env: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = json!({});
    let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(host) = non_empty("TASKSTREAM_HOST") {
        deep_merge(&mut root, &json!({ "host": host }));
    }
    if let Some(port) = non_empty("TASKSTREAM_PORT").and_then(|v| v.trim().parse::<u16>().ok()) {
        deep_merge(&mut root, &json!({ "port": port }));
    }
    if let Some(secs) =
        non_empty("TASKSTREAM_HEARTBEAT_SECS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "heartbeat_secs": secs }));
    }
    if let Some(ms) =
        non_empty("TASKSTREAM_REPLAY_PACING_MS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "replay_pacing_ms": ms }));
    }
    if let Some(policy) = non_empty("TASKSTREAM_CONFLICT_POLICY")
        .as_deref()
        .and_then(ConflictPolicy::parse)
    {
        deep_merge(&mut root, &json!({ "conflict_policy": policy }));
    }
    if let Some(command) = non_empty("TASKSTREAM_AGENT_COMMAND") {
        deep_merge(&mut root, &json!({ "agent": { "command": command } }));
    }
    if let Some(secs) =
        non_empty("TASKSTREAM_AGENT_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "agent": { "timeout_secs": secs } }));
    }
    root
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
