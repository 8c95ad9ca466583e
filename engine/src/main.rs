use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use taskstream_client::{ClientSynchronizer, SyncEvent};
use taskstream_core::{default_state_dir, ConflictPolicy, ServerConfig};
use taskstream_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use taskstream_server::{agent_from_config, serve, AppState};
use taskstream_types::{Task, TaskMode, TaskStatus, Watermark};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "taskstream")]
#[command(about = "Durable task workflows with a resumable push stream")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host")]
        hostname: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        /// `continue` or `restart`
        #[arg(long)]
        conflict_policy: Option<String>,
        #[arg(long)]
        agent_command: Option<String>,
        #[arg(long)]
        agent_script: Option<String>,
    },
    /// Follow one task's push stream and print what arrives.
    Watch {
        #[arg(long, default_value = "http://127.0.0.1:3001")]
        base_url: String,
        #[arg(long)]
        task_id: String,
        #[arg(long, default_value = "")]
        title: String,
        /// Last applied sequence; non-zero triggers recovery on connect.
        #[arg(long, default_value_t = 0)]
        since: u64,
        /// Overrides `settle_delay_ms` from the config file.
        #[arg(long)]
        settle_delay_ms: Option<u64>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        /// Start (or continue) the task with this prompt before watching.
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long, env = "TASKSTREAM_TOKEN", default_value = "", hide_env_values = true)]
        token: String,
        /// Keep watching after the task reaches DONE.
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
            conflict_policy,
            agent_command,
            agent_script,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let config_path = resolve_config_path(config, &state_dir);
            let conflict_policy = conflict_policy
                .map(|raw| {
                    ConflictPolicy::parse(&raw).with_context(|| {
                        format!("unsupported conflict policy `{raw}` (expected continue or restart)")
                    })
                })
                .transpose()?;
            let overrides = build_cli_overrides(
                hostname,
                port,
                conflict_policy,
                agent_command,
                agent_script,
            );
            let config = ServerConfig::resolve(config_path.as_deref(), overrides)
                .context("failed to load server config")?;

            let logs_dir = config.logs_dir_or(&state_dir);
            let log_session =
                init_process_logging(ProcessKind::Server, &logs_dir, config.log_retention_days)
                    .context("failed to initialize logging")?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("server jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!(
                logs_dir = %log_session.logs_dir.display(),
                prefix = %log_session.file_prefix,
                pruned = log_session.pruned_files,
                "server logging initialized"
            );

            let addr: SocketAddr = format!("{}:{}", config.host, config.port)
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, config_path.as_deref(), &addr);

            let agent = agent_from_config(&config.agent)?;
            let state = AppState::new(config, agent);
            serve(addr, state).await?;
        }
        Command::Watch {
            base_url,
            task_id,
            title,
            since,
            settle_delay_ms,
            state_dir,
            config,
            prompt,
            token,
            follow,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let config_path = resolve_config_path(config, &state_dir);
            let config = resolve_watch_config(config_path.as_deref(), settle_delay_ms)?;
            let logs_dir = config.logs_dir_or(&state_dir);
            let _log_session =
                init_process_logging(ProcessKind::Client, &logs_dir, config.log_retention_days)
                    .context("failed to initialize logging")?;

            let mut task = Task::new(title, TaskMode::Code);
            task.id = task_id;
            let mut sync = ClientSynchronizer::new(base_url, task)
                .with_settle_delay(config.settle_delay())
                .with_watermark(Watermark {
                    last_sequence: since,
                    last_timestamp: 0,
                });
            let start = prompt.map(|prompt| StartRequest { prompt, token });
            watch(&mut sync, follow, start).await?;
        }
    }

    Ok(())
}

struct StartRequest {
    prompt: String,
    token: String,
}

/// Follows the task until it is DONE (or forever with `follow`). A pending
/// start is sent only once the stream is registered, so no live update of
/// the new run can slip past the subscription.
async fn watch(
    sync: &mut ClientSynchronizer,
    follow: bool,
    mut start: Option<StartRequest>,
) -> anyhow::Result<()> {
    let mut backoff = Duration::from_millis(500);
    loop {
        if let Err(err) = sync.open().await {
            tracing::warn!(error = %err, "push stream connect failed");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(10));
            continue;
        }
        backoff = Duration::from_millis(500);

        if let Some(request) = start.take() {
            let started = sync
                .start_workflow(Some(&request.prompt), &request.token, None)
                .await
                .context("failed to start task workflow")?;
            print_line(json!({
                "event": "started",
                "workflowId": started.workflow_id,
                "message": started.message,
            }));
        }

        while let Some(event) = sync.next_event().await {
            match &event {
                SyncEvent::Connected { connection_id } => {
                    print_line(json!({"event": "connected", "connectionId": connection_id}));
                }
                SyncEvent::Envelope(envelope) => {
                    print_line(serde_json::to_value(envelope)?);
                }
                SyncEvent::Recovered { recovered_updates } => {
                    print_line(json!({"event": "recovered", "recoveredUpdates": recovered_updates}));
                }
                SyncEvent::RecoveryFailed { error } => {
                    print_line(json!({"event": "recovery_failed", "error": error}));
                }
                SyncEvent::Disconnected => break,
            }
            if !follow && sync.task().is_some_and(|t| t.status == TaskStatus::Done) {
                sync.close();
                print_task(sync)?;
                return Ok(());
            }
        }

        // stream dropped; reconcile against the engine before reconnecting
        match sync.reconcile_status().await {
            Ok(status) => info!(status = ?status.status, "reconciled after disconnect"),
            Err(err) => tracing::warn!(error = %err, "status reconcile failed"),
        }
        if !follow && sync.task().is_some_and(|t| t.status == TaskStatus::Done) {
            sync.backfill().await.ok();
            print_task(sync)?;
            return Ok(());
        }
        tokio::time::sleep(backoff).await;
    }
}

fn print_task(sync: &ClientSynchronizer) -> anyhow::Result<()> {
    if let Some(task) = sync.task() {
        print_line(json!({"event": "task", "task": serde_json::to_value(task)?}));
    }
    Ok(())
}

fn print_line(value: Value) {
    println!("{value}");
}

fn build_cli_overrides(
    hostname: Option<String>,
    port: Option<u16>,
    conflict_policy: Option<ConflictPolicy>,
    agent_command: Option<String>,
    agent_script: Option<String>,
) -> Value {
    let mut root = serde_json::Map::new();
    if let Some(host) = hostname {
        root.insert("host".to_string(), Value::String(host));
    }
    if let Some(port) = port {
        root.insert("port".to_string(), json!(port));
    }
    if let Some(policy) = conflict_policy {
        root.insert("conflict_policy".to_string(), json!(policy));
    }
    let mut agent = serde_json::Map::new();
    if let Some(command) = agent_command {
        agent.insert("command".to_string(), Value::String(command));
    }
    if let Some(script) = agent_script {
        agent.insert("script".to_string(), Value::String(script));
    }
    if !agent.is_empty() {
        root.insert("agent".to_string(), Value::Object(agent));
    }
    Value::Object(root)
}

/// Client side of the layered config: the file and env supply
/// `settle_delay_ms` and logging, the flag wins when given.
fn resolve_watch_config(
    config_path: Option<&Path>,
    settle_delay_ms: Option<u64>,
) -> anyhow::Result<ServerConfig> {
    let overrides = match settle_delay_ms {
        Some(ms) => json!({ "settle_delay_ms": ms }),
        None => json!({}),
    };
    ServerConfig::resolve(config_path, overrides).context("failed to load config")
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("TASKSTREAM_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    default_state_dir()
}

fn resolve_config_path(flag: Option<String>, state_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(PathBuf::from(path));
    }
    let candidate = state_dir.join("config.json");
    candidate.is_file().then_some(candidate)
}

fn log_startup_paths(state_dir: &Path, config_path: Option<&Path>, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting taskstream on http://{addr}");
    info!(
        "startup paths: exe={} state_dir={} config_path={}",
        exe.display(),
        state_dir.display(),
        config_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<defaults>".to_string())
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use taskstream_core::ScriptedAgent;
    use taskstream_server::serve_listener;
    use tokio::sync::oneshot;

    #[test]
    fn cli_overrides_only_include_given_flags() {
        assert_eq!(build_cli_overrides(None, None, None, None, None), json!({}));

        let overrides = build_cli_overrides(
            Some("0.0.0.0".to_string()),
            Some(4100),
            Some(ConflictPolicy::Restart),
            None,
            Some("/tmp/run.ndjson".to_string()),
        );
        assert_eq!(
            overrides,
            json!({
                "host": "0.0.0.0",
                "port": 4100,
                "conflict_policy": "restart",
                "agent": {"script": "/tmp/run.ndjson"},
            })
        );
    }

    #[test]
    fn config_path_prefers_flag_then_state_dir_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(resolve_config_path(None, dir.path()), None);

        let file = dir.path().join("config.json");
        std::fs::write(&file, "{}").expect("write");
        assert_eq!(resolve_config_path(None, dir.path()), Some(file));
        assert_eq!(
            resolve_config_path(Some("/etc/taskstream.json".to_string()), dir.path()),
            Some(PathBuf::from("/etc/taskstream.json"))
        );
    }

    #[test]
    fn watch_settle_delay_comes_from_config_unless_flagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("config.json");
        std::fs::write(&file, r#"{"settle_delay_ms": 250}"#).expect("write");

        let from_file = resolve_watch_config(Some(&file), None).expect("config");
        assert_eq!(from_file.settle_delay(), Duration::from_millis(250));
        let flagged = resolve_watch_config(Some(&file), Some(40)).expect("config");
        assert_eq!(flagged.settle_delay(), Duration::from_millis(40));
        let defaults = resolve_watch_config(None, None).expect("config");
        assert_eq!(defaults.settle_delay(), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn watch_with_prompt_sees_a_run_that_finishes_instantly() {
        let config = ServerConfig {
            replay_pacing_ms: 0,
            ..ServerConfig::default()
        };
        let agent = ScriptedAgent::new(vec!["one".to_string(), "two".to_string()]);
        let state = AppState::new(config, Arc::new(agent));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (_stop, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(serve_listener(listener, state, async {
            let _ = stop_rx.await;
        }));

        let task = Task::new("Watch a fast run", TaskMode::Code);
        let mut sync = ClientSynchronizer::new(format!("http://{addr}"), task)
            .with_settle_delay(Duration::from_millis(10));
        let start = StartRequest {
            prompt: "go".to_string(),
            token: String::new(),
        };

        tokio::time::timeout(Duration::from_secs(5), watch(&mut sync, false, Some(start)))
            .await
            .expect("watch returns once the task is done")
            .expect("watch");

        // status, two messages, status
        assert_eq!(sync.watermark().last_sequence, 4);
        let task = sync.task().expect("task");
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.messages.len(), 2);
    }
}
