use std::sync::Arc;

use anyhow::Context;
use taskstream_core::{
    Agent, AgentConfig, BroadcastHub, CommandAgent, ScriptedAgent, ServerConfig, Transport,
};
use taskstream_orchestrator::{Activities, InMemoryEngine, RecoveryService, TaskService};

mod http;

pub use http::{app_router, serve, serve_listener};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub hub: BroadcastHub,
    pub transport: Transport,
    pub engine: InMemoryEngine,
    pub tasks: TaskService,
    pub recovery: RecoveryService,
}

impl AppState {
    pub fn new(config: ServerConfig, agent: Arc<dyn Agent>) -> Self {
        let hub = BroadcastHub::new();
        let transport = Transport::new(hub.clone(), config.heartbeat(), config.sink_capacity);
        let activities = Activities::from_config(Arc::new(hub.clone()), agent, &config);
        let engine = InMemoryEngine::new(Arc::new(activities));
        let tasks = TaskService::from_config(Arc::new(engine.clone()), &config);
        let recovery = RecoveryService::new(
            Arc::new(engine.clone()),
            Arc::new(hub.clone()),
            config.replay_pacing(),
        );
        Self {
            config: Arc::new(config),
            hub,
            transport,
            engine,
            tasks,
            recovery,
        }
    }

    /// Tears down live connections and open instances.
    pub async fn shutdown(&self) {
        self.engine.terminate_all("server shutdown").await;
        self.hub.clear();
    }
}

/// Agent adapter selected by config: an external command, a replay script,
/// or a stand-in that fails every turn with a configuration hint.
pub fn agent_from_config(config: &AgentConfig) -> anyhow::Result<Arc<dyn Agent>> {
    if let Some(command) = config.command.as_deref().filter(|c| !c.trim().is_empty()) {
        return Ok(Arc::new(CommandAgent::new(command, config.args.clone())));
    }
    if let Some(script) = config.script.as_deref() {
        let agent = ScriptedAgent::from_ndjson_file(script)
            .with_context(|| format!("failed to load agent script {}", script.display()))?;
        return Ok(Arc::new(agent));
    }
    tracing::warn!("no agent command configured; task workflows will fail until one is set");
    Ok(Arc::new(ScriptedAgent::default().failing_with(
        "no agent command configured (set agent.command or TASKSTREAM_AGENT_COMMAND)",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_script_is_reported_with_path() {
        let config = AgentConfig {
            script: Some(PathBuf::from("/definitely/not/here.ndjson")),
            ..AgentConfig::default()
        };
        let err = agent_from_config(&config).err().expect("error");
        assert!(err.to_string().contains("/definitely/not/here.ndjson"));
    }

    #[test]
    fn command_takes_precedence_over_script() {
        let config = AgentConfig {
            command: Some("codex".to_string()),
            script: Some(PathBuf::from("/definitely/not/here.ndjson")),
            ..AgentConfig::default()
        };
        assert!(agent_from_config(&config).is_ok());
    }
}
