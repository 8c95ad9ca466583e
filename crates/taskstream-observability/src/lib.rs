use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OBS_TARGET: &str = "taskstream.obs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Server,
    Client,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Server => "server",
            ProcessKind::Client => "client",
        }
    }

    fn file_prefix(self) -> String {
        format!("taskstream.{}", self.as_str())
    }
}

/// Structured lifecycle event. Every field lands as a flat key on the
/// `taskstream.obs` target so JSONL consumers can filter without parsing
/// the message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub task_id: Option<&'a str>,
    pub workflow_id: Option<&'a str>,
    pub connection_id: Option<&'a str>,
    pub sequence: Option<u64>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

macro_rules! obs_event {
    ($level:expr, $process:expr, $event:expr) => {
        tracing::event!(
            target: OBS_TARGET,
            $level,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            task_id = $event.task_id.unwrap_or(""),
            workflow_id = $event.workflow_id.unwrap_or(""),
            connection_id = $event.connection_id.unwrap_or(""),
            sequence = $event.sequence.unwrap_or(0),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = %$event.detail.map(mask_secrets).unwrap_or_default(),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    // tracing needs the level as a constant at each callsite
    match level {
        Level::ERROR => obs_event!(Level::ERROR, process, event),
        Level::WARN => obs_event!(Level::WARN, process, event),
        Level::DEBUG | Level::TRACE => obs_event!(Level::DEBUG, process, event),
        _ => obs_event!(Level::INFO, process, event),
    }
}

/// Placeholder for a whole secret value: only its length survives.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={}]", trimmed.chars().count())
}

fn secret_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)\b(gh[pousr]_[A-Za-z0-9]{6,}|github_pat_[A-Za-z0-9_]{6,}|sk-[A-Za-z0-9_\-]{8,})|(bearer\s+)[A-Za-z0-9._\-]{8,}",
            )
            .ok()
        })
        .as_ref()
}

/// Masks token-shaped substrings (GitHub tokens, API keys, bearer headers)
/// inside free text such as agent stderr.
pub fn mask_secrets(input: &str) -> String {
    let Some(pattern) = secret_pattern() else {
        return input.to_string();
    };
    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| match caps.get(2) {
            Some(bearer) => format!("{}[redacted]", bearer.as_str()),
            None => "[redacted]".to_string(),
        })
        .into_owned()
}

/// Keeps the file writer alive; dropping it flushes pending JSONL lines.
pub struct LogSession {
    pub process: ProcessKind,
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    _guard: WorkerGuard,
}

/// Console plus daily-rotated `taskstream.<process>.YYYY-MM-DD.jsonl` files.
/// `RUST_LOG` overrides the default `info` filter. A second call in the same
/// process keeps the first subscriber.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<LogSession> {
    fs::create_dir_all(logs_dir)?;
    let pruned_files =
        prune_expired_logs(logs_dir, process, retention_days, Utc::now().date_naive())?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(process.file_prefix())
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init();

    Ok(LogSession {
        process,
        logs_dir: logs_dir.to_path_buf(),
        file_prefix: process.file_prefix(),
        retention_days,
        pruned_files,
        _guard: guard,
    })
}

fn log_file_date(name: &str, process: ProcessKind) -> Option<NaiveDate> {
    let rest = name.strip_prefix(&process.file_prefix())?.strip_prefix('.')?;
    let date = rest.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Removes this process's JSONL files dated before `today - retention_days`.
/// Files of other processes and unparseable names are left alone.
pub fn prune_expired_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
    today: NaiveDate,
) -> anyhow::Result<usize> {
    let Some(cutoff) = today.checked_sub_days(chrono::Days::new(retention_days)) else {
        return Ok(0);
    };
    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| log_file_date(n, process))
        else {
            continue;
        };
        if date < cutoff && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
