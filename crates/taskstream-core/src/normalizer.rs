//! Maps raw agent output onto the canonical update taxonomy.
//!
//! Agents emit plain text, a single JSON object, newline-delimited JSON, JSON
//! embedded in surrounding noise, or tool traffic wrapped in the `stdout` of an
//! `end` record. Parsing is an ordered list of strategies; the first one that
//! recognizes anything wins and everything unrecognized degrades to `text`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use taskstream_types::MessageRole;

const SHELL_NOISE: [&str; 3] = ["/bin/bash:", "command not found", "No such file or directory"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCategory {
    LocalShellCall,
    LocalShellCallOutput,
    Git,
    Message(MessageRole),
    Error,
    Text,
}

impl UpdateCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateCategory::LocalShellCall => "local_shell_call",
            UpdateCategory::LocalShellCallOutput => "local_shell_call_output",
            UpdateCategory::Git => "git",
            UpdateCategory::Message(_) => "message",
            UpdateCategory::Error => "error",
            UpdateCategory::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedUpdate {
    pub category: UpdateCategory,
    /// Canonical message object; always carries a `type` field.
    pub message: Value,
}

impl NormalizedUpdate {
    fn new(category: UpdateCategory, message: Value) -> Self {
        Self { category, message }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(
            UpdateCategory::Text,
            json!({"type": "text", "content": content.into()}),
        )
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(
            UpdateCategory::Error,
            json!({
                "type": "error",
                "content": content.into(),
                "timestamp": taskstream_types::now_ms(),
            }),
        )
    }

    pub fn assistant_message(text: impl Into<String>) -> Self {
        Self::new(
            UpdateCategory::Message(MessageRole::Assistant),
            json!({
                "type": "message",
                "role": "assistant",
                "status": "completed",
                "data": {"text": text.into()},
            }),
        )
    }

    /// Log payload for a `message` update of `task_id`.
    pub fn into_payload(self, task_id: &str) -> Value {
        json!({"taskId": task_id, "message": self.message})
    }
}

/// A fragment recognized by a strategy: either a JSON object or an opaque line.
#[derive(Debug, Clone)]
enum Fragment {
    Object { value: Value, raw: String },
    Text(String),
}

trait ParseStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, raw: &str) -> Option<Vec<Fragment>>;
}

struct WholeMessage;
struct LinePerObject;
struct EmbeddedObject;

impl ParseStrategy for WholeMessage {
    fn name(&self) -> &'static str {
        "whole_message"
    }

    fn parse(&self, raw: &str) -> Option<Vec<Fragment>> {
        let value = parse_object(raw)?;
        Some(vec![Fragment::Object {
            value,
            raw: raw.to_string(),
        }])
    }
}

impl ParseStrategy for LinePerObject {
    fn name(&self) -> &'static str {
        "line_per_object"
    }

    fn parse(&self, raw: &str) -> Option<Vec<Fragment>> {
        let lines = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        if lines.len() < 2 {
            return None;
        }
        let mut fragments = Vec::with_capacity(lines.len());
        let mut recognized = false;
        for line in lines {
            if let Some(value) = parse_object(line).or_else(|| extract_object(line)) {
                recognized = true;
                fragments.push(Fragment::Object {
                    value,
                    raw: line.to_string(),
                });
            } else if !is_shell_noise(line) {
                fragments.push(Fragment::Text(line.to_string()));
            }
        }
        recognized.then_some(fragments)
    }
}

impl ParseStrategy for EmbeddedObject {
    fn name(&self) -> &'static str {
        "embedded_object"
    }

    fn parse(&self, raw: &str) -> Option<Vec<Fragment>> {
        let value = extract_object(raw)?;
        Some(vec![Fragment::Object {
            value,
            raw: raw.to_string(),
        }])
    }
}

pub struct Normalizer {
    strategies: Vec<Box<dyn ParseStrategy>>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Box::new(WholeMessage),
                Box::new(LinePerObject),
                Box::new(EmbeddedObject),
            ],
        }
    }

    /// Never fails. Shell noise yields an empty list; anything else yields at
    /// least one update.
    pub fn normalize(&self, raw: &str) -> Vec<NormalizedUpdate> {
        if raw.trim().is_empty() {
            return Vec::new();
        }
        for strategy in &self.strategies {
            let Some(fragments) = strategy.parse(raw) else {
                continue;
            };
            tracing::trace!(strategy = strategy.name(), "agent output recognized");
            return fragments.into_iter().flat_map(classify_fragment).collect();
        }
        if is_shell_noise(raw) {
            tracing::debug!("discarding shell error line from agent output");
            return Vec::new();
        }
        vec![NormalizedUpdate::text(raw)]
    }
}

fn classify_fragment(fragment: Fragment) -> Vec<NormalizedUpdate> {
    match fragment {
        Fragment::Text(line) => vec![NormalizedUpdate::text(line)],
        Fragment::Object { value, raw } => classify_object(value, &raw),
    }
}

fn classify_object(value: Value, raw: &str) -> Vec<NormalizedUpdate> {
    let Value::Object(mut obj) = value else {
        return vec![NormalizedUpdate::text(raw)];
    };
    let kind = obj.get("type").and_then(|v| v.as_str()).unwrap_or_default();
    match kind {
        "local_shell_call" => {
            if !obj.contains_key("call_id") {
                if let Some(id) = obj.get("id").cloned() {
                    obj.insert("call_id".to_string(), id);
                }
            }
            obj.entry("status").or_insert_with(|| json!("completed"));
            vec![NormalizedUpdate::new(
                UpdateCategory::LocalShellCall,
                Value::Object(obj),
            )]
        }
        "local_shell_call_output" => vec![NormalizedUpdate::new(
            UpdateCategory::LocalShellCallOutput,
            Value::Object(obj),
        )],
        "git" => {
            if !obj.contains_key("output") {
                if let Some(message) = obj.get("message").cloned() {
                    obj.insert("output".to_string(), message);
                }
            }
            vec![NormalizedUpdate::new(UpdateCategory::Git, Value::Object(obj))]
        }
        "message" => {
            let role = obj
                .get("role")
                .and_then(|v| v.as_str())
                .and_then(MessageRole::parse);
            match role {
                Some(role) => vec![chat_message(role, &obj)],
                None => vec![NormalizedUpdate::text(raw)],
            }
        }
        "error" => {
            let content = ["content", "message", "error"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(|v| v.as_str()))
                .unwrap_or(raw)
                .to_string();
            vec![NormalizedUpdate::error(content)]
        }
        "end" => {
            let unwrapped = unwrap_end_record(&obj);
            if unwrapped.is_empty() {
                vec![NormalizedUpdate::text(raw)]
            } else {
                unwrapped
            }
        }
        _ => vec![NormalizedUpdate::text(raw)],
    }
}

fn chat_message(role: MessageRole, obj: &Map<String, Value>) -> NormalizedUpdate {
    let text = match obj.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .find(|item| {
                matches!(
                    item.get("type").and_then(|v| v.as_str()),
                    Some("text") | Some("input_text") | Some("output_text")
                )
            })
            .and_then(|item| item.get("text"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    };
    let role_name = match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    };
    NormalizedUpdate::new(
        UpdateCategory::Message(role),
        json!({
            "type": "message",
            "role": role_name,
            "status": "completed",
            "data": {"text": text},
        }),
    )
}

/// Tool traffic nested as NDJSON inside `{"type":"end","output":"{\"stdout\":...}"}`.
fn unwrap_end_record(obj: &Map<String, Value>) -> Vec<NormalizedUpdate> {
    let Some(output) = obj.get("output").and_then(|v| v.as_str()) else {
        return Vec::new();
    };
    let Ok(output) = serde_json::from_str::<Value>(output) else {
        return Vec::new();
    };
    let Some(stdout) = output.get("stdout").and_then(|v| v.as_str()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(line) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(content) = line
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        else {
            continue;
        };
        match line.get("type").and_then(|v| v.as_str()) {
            Some("assistant") => {
                for item in content {
                    if item.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                        out.push(tool_use_to_shell_call(item));
                    }
                }
            }
            Some("user") => {
                for item in content {
                    if item.get("type").and_then(|v| v.as_str()) == Some("tool_result") {
                        out.push(tool_result_to_output(item));
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn tool_use_to_shell_call(item: &Value) -> NormalizedUpdate {
    let id = item.get("id").cloned().unwrap_or(Value::Null);
    let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
    let input = item.get("input").cloned().unwrap_or_else(|| json!({}));
    let (command, description) = match name {
        "LS" => {
            let path = input.get("path").and_then(|v| v.as_str());
            (
                format!("ls -la {}", path.unwrap_or(".")),
                format!("List files in {}", path.unwrap_or("current directory")),
            )
        }
        "Bash" => {
            let command = input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let description = input
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| command.clone());
            (command, description)
        }
        other => (
            format!("{} {}", other.to_lowercase(), input),
            format!("Execute {} tool", other),
        ),
    };
    NormalizedUpdate::new(
        UpdateCategory::LocalShellCall,
        json!({
            "type": "local_shell_call",
            "status": "completed",
            "action": {
                "command": ["bash", "-c", command],
                "description": description,
            },
            "call_id": id,
            "id": id,
        }),
    )
}

fn tool_result_to_output(item: &Value) -> NormalizedUpdate {
    let exit_code = if item.get("is_error").and_then(|v| v.as_bool()) == Some(true) {
        1
    } else {
        0
    };
    let output = json!({
        "output": item.get("content").cloned().unwrap_or(Value::Null),
        "metadata": {"exit_code": exit_code},
    });
    NormalizedUpdate::new(
        UpdateCategory::LocalShellCallOutput,
        json!({
            "type": "local_shell_call_output",
            "call_id": item.get("tool_use_id").cloned().unwrap_or(Value::Null),
            "output": output.to_string(),
        }),
    )
}

fn parse_object(raw: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn extract_object(raw: &str) -> Option<Value> {
    static OBJECT_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = OBJECT_RE
        .get_or_init(|| Regex::new(r"(?s)\{.*\}").ok())
        .as_ref()?;
    re.find(raw).and_then(|m| parse_object(m.as_str()))
}

/// Substring match. For plain text that no strategy recognized, the whole
/// message is tested and dropped on a hit, surrounding prose included; only
/// messages that also carry JSON objects are filtered line by line.
fn is_shell_noise(raw: &str) -> bool {
    SHELL_NOISE.iter().any(|needle| raw.contains(needle))
}
