//! One model turn: build the prompt from the tape, call the provider, and run
//! native tool calls until the model answers in text.
//!
//! Every tool observation is fingerprinted. When a whole round of calls only
//! repeats what was already seen, the runner stops offering tools and asks for
//! a direct answer instead.

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tapeloop_config::AppConfig;
use tapeloop_core::Error;
use tapeloop_core::error::ProviderError;
use tapeloop_core::message::{Message, MessageToolCall};
use tapeloop_core::provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition};
use tapeloop_core::tool::{ToolCall, ToolRegistry};
use tapeloop_tape::{MemoryZone, TapeService};
use tracing::{debug, info, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are tapeloop, an agent working inside a shell workspace. \
Run an action by writing `$name key=value` at the start of a line: `$tape.search query=...` for tools, \
`$ls -la` for shell commands. Results come back to you as <cmd> blocks. \
Write `$done` once the task is finished and answer in concise natural language.";

pub const STAGNATION_RECOVERY_PROMPT: &str = "Tool observations are repeating with no new information. \
Do not call any tool. Provide a final direct answer based on current context.";

pub const STAGNATION_FALLBACK: &str = "Unable to make further progress with tools. Please refine the request.";

const REPEAT_NOTE: &str = "No new information from repeated tool call.";
const HUMAN_PREVIEW_MAX_LEN: usize = 240;
const HUMAN_PREVIEW_TRUNCATE_LEN: usize = 237;

const VERIFICATION_TOOLS: &[&str] = &[
    "fs.read",
    "tape.info",
    "tape.search",
    "tape.anchors",
    "tape.read",
    "memory.recall",
    "memory.show",
    "help",
    "tools",
    "tool.describe",
];

const BASH_VERIFICATION_TOKENS: &[&str] = &[
    "pytest",
    "unittest",
    "go test",
    "cargo test",
    "cargo check",
    "just test",
    "make test",
    "npm test",
    "pnpm test",
    "ls",
    "cat ",
    "grep ",
    "find ",
    "wc ",
    "head ",
    "tail ",
    "stat ",
];

/// Knobs for a [`ModelRunner`].
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    /// Per provider call; `None` waits forever.
    pub timeout: Option<Duration>,
    pub max_tool_rounds: u32,
    /// Consecutive all-repeat rounds before recovery.
    pub stagnation_window: u32,
}

impl ModelSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            timeout: config.agent.model_timeout_secs.map(Duration::from_secs),
            max_tool_rounds: config.agent.max_tool_rounds,
            stagnation_window: config.agent.stagnation_window.max(1),
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// A tool observation as fed back to the model.
#[derive(Debug, Clone)]
struct Observation {
    call_id: String,
    payload: Value,
    repeat: bool,
}

pub struct ModelRunner {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    tape: TapeService,
    memory: Arc<MemoryZone>,
    settings: ModelSettings,
}

impl ModelRunner {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        tape: TapeService,
        memory: Arc<MemoryZone>,
        settings: ModelSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            tape,
            memory,
            settings,
        }
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// Produce the assistant text for the current tape context.
    pub async fn respond(&self) -> Result<String, Error> {
        let mut messages = self.build_messages().await?;
        let definitions = self.tools.definitions();
        let mut fingerprints: HashMap<String, String> = HashMap::new();
        let mut stagnant_rounds = 0u32;
        let mut rounds = 0u32;

        loop {
            let response = self.complete(messages.clone(), definitions.clone()).await?;
            let message = response.message;
            if message.tool_calls.is_empty() {
                return Ok(message.content);
            }

            rounds += 1;
            let calls = message.tool_calls.clone();
            self.tape
                .record_tool_call(calls.iter().map(call_record).collect())
                .await?;
            messages.push(message);

            let observations = self.execute_calls(&calls, &mut fingerprints).await;
            self.tape
                .record_tool_result(observations.iter().map(|o| o.payload.clone()).collect())
                .await?;
            let fresh = observations.iter().any(|o| !o.repeat);
            for observation in observations {
                messages.push(Message::tool_result(observation.call_id, observation.payload.to_string()));
            }

            stagnant_rounds = if fresh { 0 } else { stagnant_rounds + 1 };
            if stagnant_rounds >= self.settings.stagnation_window {
                warn!(rounds, "tool observations stagnant, forcing direct answer");
                self.tape
                    .append_event("model.stagnation", json!({"rounds": rounds}))
                    .await?;
                return self.recover(messages).await;
            }
            if rounds >= self.settings.max_tool_rounds {
                warn!(rounds, "tool round budget exhausted, forcing direct answer");
                self.tape
                    .append_event("model.tool_rounds_exhausted", json!({"rounds": rounds}))
                    .await?;
                return self.recover(messages).await;
            }
        }
    }

    async fn build_messages(&self) -> Result<Vec<Message>, Error> {
        let memory = self.memory.get_context().await?;
        let system = [self.settings.system_prompt.trim(), memory.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(Message::system(system));
        }
        messages.extend(self.tape.context_messages().await?);
        Ok(messages)
    }

    async fn complete(&self, messages: Vec<Message>, tools: Vec<ToolDefinition>) -> Result<ProviderResponse, Error> {
        let request = ProviderRequest::new(&self.settings.model, messages)
            .with_max_tokens(self.settings.max_tokens)
            .with_tools(tools);
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "model request"
        );

        let call = self.provider.complete(request);
        let response = match self.settings.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ProviderError::Timeout(limit.as_secs()))?,
            None => call.await,
        };
        Ok(response?)
    }

    async fn recover(&self, mut messages: Vec<Message>) -> Result<String, Error> {
        messages.push(Message::system(STAGNATION_RECOVERY_PROMPT));
        let response = self.complete(messages, Vec::new()).await?;
        let text = response.message.content.trim();
        if text.is_empty() {
            info!("stagnation recovery produced no answer");
            return Ok(STAGNATION_FALLBACK.to_string());
        }
        Ok(text.to_string())
    }

    async fn execute_calls(
        &self,
        calls: &[MessageToolCall],
        fingerprints: &mut HashMap<String, String>,
    ) -> Vec<Observation> {
        let mut observations = Vec::with_capacity(calls.len());

        for (index, call) in calls.iter().enumerate() {
            let call_id = if call.id.is_empty() {
                index.to_string()
            } else {
                call.id.clone()
            };
            let arguments = parse_arguments(&call.arguments);
            let signature = format!("{}:{}", call.name, normalize_arguments(&call.arguments));

            let invocation = ToolCall {
                id: call_id.clone(),
                name: call.name.clone(),
                arguments: arguments.clone(),
            };
            let raw_output = match self.tools.execute(&invocation).await {
                Ok(result) if result.success => result.output,
                Ok(result) => format!("error: {}", result.output),
                Err(e) => format!("error: {e}"),
            };

            let fingerprint = fingerprint(&raw_output);
            let repeat = fingerprints.get(&signature) == Some(&fingerprint);
            fingerprints.insert(signature.clone(), fingerprint);
            debug!(tool = %call.name, repeat, "tool call observed");

            let mut payload = Map::new();
            payload.insert("tool".into(), Value::String(call.name.clone()));
            payload.insert("signature".into(), Value::String(signature));
            payload.insert(
                "category".into(),
                Value::String(category(&call.name, &arguments).into()),
            );
            payload.insert("status".into(), Value::String(status(&raw_output, repeat).into()));
            payload.insert("repeat".into(), Value::Bool(repeat));
            payload.insert("machine_readable".into(), machine_readable(&raw_output));
            payload.insert("human_preview".into(), Value::String(human_preview(&raw_output)));
            if repeat {
                payload.insert("note".into(), Value::String(REPEAT_NOTE.into()));
            }

            observations.push(Observation {
                call_id,
                payload: Value::Object(payload),
                repeat,
            });
        }

        observations
    }
}

fn call_record(call: &MessageToolCall) -> Value {
    json!({
        "id": call.id,
        "name": call.name,
        "arguments": call.arguments,
    })
}

fn parse_arguments(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value @ Value::Object(_)) => value,
        _ => Value::Object(Map::new()),
    }
}

/// Compact JSON with sorted keys, or the trimmed text if it is not JSON.
fn normalize_arguments(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "{}".into();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => sorted(value).to_string(),
        Err(_) => raw.to_string(),
    }
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

fn fingerprint(output: &str) -> String {
    hex::encode(Sha256::digest(output.trim().as_bytes()))
}

fn status(output: &str, repeat: bool) -> &'static str {
    if repeat {
        "stagnant"
    } else if output.trim().starts_with("error:") {
        "error"
    } else {
        "ok"
    }
}

fn category(name: &str, arguments: &Value) -> &'static str {
    if VERIFICATION_TOOLS.contains(&name) {
        return "verification";
    }
    if name != "bash" {
        return "operation";
    }
    let cmd = arguments
        .get("cmd")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    if BASH_VERIFICATION_TOKENS.iter().any(|token| cmd.contains(token)) {
        "verification"
    } else {
        "operation"
    }
}

fn machine_readable(output: &str) -> Value {
    let stripped = output.trim();
    if stripped.is_empty() {
        return json!({"format": "text", "value": ""});
    }
    match serde_json::from_str::<Value>(stripped) {
        Ok(parsed) => json!({"format": "json", "value": parsed}),
        Err(_) => json!({"format": "text", "value": output}),
    }
}

fn human_preview(output: &str) -> String {
    let preview = output.trim().replace('\n', " | ");
    if preview.is_empty() {
        return "(empty)".into();
    }
    if preview.chars().count() > HUMAN_PREVIEW_MAX_LEN {
        let cut: String = preview.chars().take(HUMAN_PREVIEW_TRUNCATE_LEN).collect();
        return format!("{cut}...");
    }
    preview
}
