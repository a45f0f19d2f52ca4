//! Tool Registry: tool definitions, argument validation, and execution,
//! optionally isolated in a child process for real cancellation
//! (spec.md §4.8, §9 "Fork-based cancellation").

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::ServerError;
use crate::util::now_ms;

/// Schema-level parameter type tags (spec.md §3; deliberately a fixed small
/// set — arbitrary JSON Schema validation is a declared Non-goal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// One parameter's schema entry.
#[derive(Debug, Clone)]
pub struct ParamSchema {
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
    pub enum_values: Option<Vec<Value>>,
}

impl ParamSchema {
    /// Construct a required parameter with no default or enum constraint.
    pub fn required(param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            param_type,
            description: description.into(),
            required: true,
            default: None,
            enum_values: None,
        }
    }

    /// Construct an optional parameter with a default value.
    pub fn optional(param_type: ParamType, description: impl Into<String>, default: Value) -> Self {
        Self {
            param_type,
            description: description.into(),
            required: false,
            default: Some(default),
            enum_values: None,
        }
    }
}

/// A registered tool's static definition.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameter_schema: HashMap<String, ParamSchema>,
    pub required_params: Vec<String>,
    pub version: String,
    pub enabled: bool,
}

impl ToolDefinition {
    /// Render as the `tools/list` wire shape (spec.md §6).
    pub fn to_list_entry(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for (name, schema) in &self.parameter_schema {
            let mut prop = serde_json::Map::new();
            prop.insert(
                "type".to_string(),
                Value::String(
                    match schema.param_type {
                        ParamType::String => "string",
                        ParamType::Number => "number",
                        ParamType::Boolean => "boolean",
                        ParamType::Object => "object",
                        ParamType::Array => "array",
                    }
                    .to_string(),
                ),
            );
            prop.insert(
                "description".to_string(),
                Value::String(schema.description.clone()),
            );
            if let Some(enum_values) = &schema.enum_values {
                prop.insert("enum".to_string(), Value::Array(enum_values.clone()));
            }
            properties.insert(name.clone(), Value::Object(prop));
        }
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": {
                "type": "object",
                "properties": Value::Object(properties),
                "required": self.required_params,
            }
        })
    }
}

/// Flat string-accessible argument bag handed to executors (spec.md §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolArgs(HashMap<String, Value>);

impl ToolArgs {
    pub fn from_value(value: &Value) -> Self {
        let map = value
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self(map)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(|v| v.as_bool())
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// One content block of a tool result (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
    Image { data: String, mime_type: String },
    Resource { data: String, mime_type: Option<String> },
}

/// The outcome of a tool call (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(rename = "isError", skip_serializing_if = "is_false", default)]
    pub is_error: bool,
    pub content: Vec<ToolContent>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            is_error: false,
            content: vec![ToolContent::Text { text: text.into() }],
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: vec![ToolContent::Text { text: message.into() }],
        }
    }
}

/// A tool's executable behavior.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, String>;
}

struct ToolEntry {
    definition: ToolDefinition,
    executor: Arc<dyn ToolExecutor>,
}

/// Tool registry configuration (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct ToolRegistryConfig {
    pub max_execution_time_ms: u64,
    pub max_concurrent_executions: usize,
    pub safety_checks_enabled: bool,
    pub use_fork_timeout: bool,
    pub enabled: bool,
    /// Executable re-exec'd as the fork-mode tool worker. `None` resolves to
    /// `std::env::current_exe()` at call time, which is correct for the
    /// `mcp-streaming-server` binary itself but not for a `cargo test`
    /// harness binary; integration tests override this with
    /// `CARGO_BIN_EXE_mcp-streaming-server`, the same pattern the child
    /// process transport tests in the wider MCP ecosystem use to locate a
    /// sibling binary target.
    pub fork_worker_exe: Option<PathBuf>,
}

impl Default for ToolRegistryConfig {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 30_000,
            max_concurrent_executions: 10,
            safety_checks_enabled: true,
            use_fork_timeout: false,
            enabled: true,
            fork_worker_exe: None,
        }
    }
}

/// Owns every registered tool and tracks in-flight executions.
pub struct ToolRegistry {
    tools: DashMap<String, ToolEntry>,
    config: ToolRegistryConfig,
    /// One permit per concurrently in-flight execution. Acquired before a
    /// tool runs and held for the lifetime of the call, so the cap in
    /// spec.md §8 ("no more than `max_concurrent_executions` tool
    /// executions are in flight at any moment") holds even when many
    /// callers race to start a tool at once — a check-then-increment on a
    /// plain counter lets all of them past the check before any of them
    /// increments.
    execution_semaphore: Arc<Semaphore>,
}

impl ToolRegistry {
    pub fn new(config: ToolRegistryConfig) -> Self {
        let execution_semaphore = Arc::new(Semaphore::new(config.max_concurrent_executions));
        Self {
            tools: DashMap::new(),
            config,
            execution_semaphore,
        }
    }

    /// Register a tool. Fails if the name already exists.
    pub fn register_tool(
        &self,
        definition: ToolDefinition,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<(), ServerError> {
        if self.tools.contains_key(&definition.name) {
            return Err(ServerError::tool_registry(format!(
                "tool '{}' already registered",
                definition.name
            )));
        }
        self.tools
            .insert(definition.name.clone(), ToolEntry { definition, executor });
        Ok(())
    }

    /// Enabled tool definitions, for `tools/list`.
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|e| e.value().definition.enabled)
            .map(|e| e.value().definition.clone())
            .collect()
    }

    fn validate(definition: &ToolDefinition, args: &Value) -> Result<(), String> {
        let mut problems = Vec::new();
        let obj = args.as_object().cloned().unwrap_or_default();

        for required in &definition.required_params {
            if !obj.contains_key(required) {
                problems.push(format!("missing required parameter '{required}'"));
            }
        }

        for (name, schema) in &definition.parameter_schema {
            let Some(value) = obj.get(name) else { continue };
            let type_ok = match schema.param_type {
                ParamType::String => value.is_string(),
                ParamType::Number => value.is_number(),
                ParamType::Boolean => value.is_boolean(),
                ParamType::Object => value.is_object(),
                ParamType::Array => value.is_array(),
            };
            if !type_ok {
                problems.push(format!("parameter '{name}' has the wrong type"));
            }
            if let Some(enum_values) = &schema.enum_values {
                if !enum_values.contains(value) {
                    problems.push(format!("parameter '{name}' is not one of the allowed values"));
                }
            }
        }

        for key in obj.keys() {
            if !definition.parameter_schema.contains_key(key) {
                warn!(tool = %definition.name, param = %key, "unknown tool parameter");
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    /// Execute a registered tool by name. Never returns a JSON-RPC error —
    /// any failure becomes an in-band `isError: true` result, except the
    /// case where the tool truly doesn't exist, which the caller maps to
    /// `-32003` (spec.md §4.5).
    #[instrument(skip(self, args_json), fields(tool = %name))]
    pub async fn execute_tool(&self, name: &str, args_json: Value) -> Result<ToolResult, ToolNotFound> {
        if !self.config.enabled {
            return Ok(ToolResult::error("tool registry is disabled"));
        }
        let entry = self.tools.get(name).ok_or(ToolNotFound)?;
        if !entry.definition.enabled {
            return Ok(ToolResult::error(format!("tool '{name}' is disabled")));
        }

        let permit = match Arc::clone(&self.execution_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return Ok(ToolResult::error(format!(
                    "concurrency cap reached: {} executions already in flight",
                    self.config.max_concurrent_executions
                )))
            }
        };

        if self.config.safety_checks_enabled {
            if let Err(message) = Self::validate(&entry.definition, &args_json) {
                return Ok(ToolResult::error(message));
            }
        }

        let args = ToolArgs::from_value(&args_json);
        let executor = Arc::clone(&entry.executor);
        drop(entry);

        let execution_id = Uuid::new_v4();
        let timeout_ms = self.config.max_execution_time_ms;

        let result = if self.config.use_fork_timeout {
            run_forked(
                name,
                execution_id,
                args,
                timeout_ms,
                self.config.fork_worker_exe.as_deref(),
            )
            .await
        } else {
            run_inline(executor, args, timeout_ms).await
        };
        drop(permit);

        Ok(result)
    }

    /// Number of executions currently in flight.
    pub fn active_executions(&self) -> usize {
        self.config
            .max_concurrent_executions
            .saturating_sub(self.execution_semaphore.available_permits())
    }
}

/// The named tool is not registered.
#[derive(Debug, Clone, Copy)]
pub struct ToolNotFound;

async fn run_inline(executor: Arc<dyn ToolExecutor>, args: ToolArgs, timeout_ms: u64) -> ToolResult {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), executor.execute(args)).await {
        Ok(Ok(result)) => result,
        Ok(Err(message)) => ToolResult::error(message),
        Err(_) => ToolResult::error(format!("Tool execution timed out after {timeout_ms}ms")),
    }
}

#[derive(Serialize, Deserialize)]
struct ForkRequest {
    tool_name: String,
    args: Value,
}

/// Run a tool in an isolated child process, polling every 100ms and killing
/// the child with SIGKILL if it overruns `timeout_ms` (spec.md §4.8, §5).
async fn run_forked(
    tool_name: &str,
    execution_id: Uuid,
    args: ToolArgs,
    timeout_ms: u64,
    worker_exe: Option<&std::path::Path>,
) -> ToolResult {
    let request_file = match tempfile::Builder::new()
        .prefix(&format!("mcp-tool-{execution_id}-"))
        .suffix(".in.json")
        .tempfile()
    {
        Ok(f) => f,
        Err(err) => return ToolResult::error(format!("failed to stage tool worker input file: {err}")),
    };
    let result_file = match tempfile::Builder::new()
        .prefix(&format!("mcp-tool-{execution_id}-"))
        .suffix(".out.json")
        .tempfile()
    {
        Ok(f) => f,
        Err(err) => return ToolResult::error(format!("failed to stage tool worker output file: {err}")),
    };
    // Keep the child free to create/overwrite the result path: close our
    // handle but keep the unique path it reserved.
    let request_path = request_file.into_temp_path().keep().unwrap_or_default();
    let result_path = result_file.into_temp_path().keep().unwrap_or_default();

    let request = ForkRequest {
        tool_name: tool_name.to_string(),
        args: args.as_value(),
    };
    if let Err(err) = tokio::fs::write(
        &request_path,
        serde_json::to_vec(&request).unwrap_or_default(),
    )
    .await
    {
        return ToolResult::error(format!("failed to stage tool worker input: {err}"));
    }

    let exe = match worker_exe.map(PathBuf::from).or_else(|| std::env::current_exe().ok()) {
        Some(p) => p,
        None => return ToolResult::error("failed to resolve server binary".to_string()),
    };

    let spawn = tokio::process::Command::new(exe)
        .arg("--tool-worker")
        .arg(&request_path)
        .arg(&result_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match spawn {
        Ok(c) => c,
        Err(err) => {
            let _ = tokio::fs::remove_file(&request_path).await;
            return ToolResult::error(format!("failed to spawn tool worker: {err}"));
        }
    };

    let deadline = now_ms() + timeout_ms;
    let mut timed_out = false;
    loop {
        match child.try_wait() {
            Ok(Some(_status)) => break,
            Ok(None) => {
                if now_ms() >= deadline {
                    timed_out = true;
                    if let Err(err) = child.start_kill() {
                        warn!(error = %err, "failed to kill overrun tool worker");
                    }
                    crate::util::reap_child(child).await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(err) => {
                warn!(error = %err, "failed to poll tool worker");
                break;
            }
        }
    }

    let result = if timed_out {
        ToolResult::error(format!("Tool execution timed out after {timeout_ms}ms"))
    } else {
        match tokio::fs::read(&result_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .unwrap_or_else(|e| ToolResult::error(format!("malformed tool worker output: {e}"))),
            Err(err) => ToolResult::error(format!("tool worker produced no result: {err}")),
        }
    };

    let _ = tokio::fs::remove_file(&request_path).await;
    let _ = tokio::fs::remove_file(&result_path).await;
    result
}

/// Entry point used by the re-exec'd child in fork-mode execution. Looks up
/// the tool by name in `registry`, runs it to completion (no timeout — the
/// parent enforces that), and writes the result to `result_path`.
pub async fn run_tool_worker(
    registry: Arc<ToolRegistry>,
    request_path: PathBuf,
    result_path: PathBuf,
) -> std::io::Result<()> {
    let raw = tokio::fs::read(&request_path).await?;
    let request: ForkRequest = serde_json::from_slice(&raw)
        .unwrap_or_else(|_| ForkRequest { tool_name: String::new(), args: Value::Null });

    let result = match registry.tools.get(&request.tool_name) {
        Some(entry) => {
            let executor = Arc::clone(&entry.executor);
            let args = ToolArgs::from_value(&request.args);
            drop(entry);
            match executor.execute(args).await {
                Ok(r) => r,
                Err(message) => ToolResult::error(message),
            }
        }
        None => ToolResult::error(format!("tool '{}' not found", request.tool_name)),
    };

    tokio::fs::write(&result_path, serde_json::to_vec(&result)?).await
}

/// The demonstration `echo` tool used by the worked example in spec.md §8.
pub struct EchoTool;

#[async_trait]
impl ToolExecutor for EchoTool {
    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, String> {
        let message = args.get_string("message").ok_or("missing 'message' argument")?;
        Ok(ToolResult::text(format!("Echo: {message}")))
    }
}

/// Definition for [`EchoTool`].
pub fn echo_tool_definition() -> ToolDefinition {
    let mut parameter_schema = HashMap::new();
    parameter_schema.insert(
        "message".to_string(),
        ParamSchema::required(ParamType::String, "the text to echo back"),
    );
    ToolDefinition {
        name: "echo".to_string(),
        description: "Echoes the provided message back to the caller".to_string(),
        parameter_schema,
        required_params: vec!["message".to_string()],
        version: "1.0".to_string(),
        enabled: true,
    }
}

/// A second demonstration tool, grounded in spec.md §8 scenario 4 (the
/// fork-mode timeout worked example): sleeps for `duration_ms`, so a
/// fork-mode-enabled registry with a short `max_execution_time_ms` can be
/// exercised against a real subprocess boundary.
pub struct SleepTool;

#[async_trait]
impl ToolExecutor for SleepTool {
    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, String> {
        let duration_ms = args.get_int("duration_ms").unwrap_or(5000).max(0) as u64;
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        Ok(ToolResult::text(format!("slept {duration_ms}ms")))
    }
}

/// Definition for [`SleepTool`].
pub fn sleep_tool_definition() -> ToolDefinition {
    let mut parameter_schema = HashMap::new();
    parameter_schema.insert(
        "duration_ms".to_string(),
        ParamSchema::optional(ParamType::Number, "how long to sleep, in milliseconds", Value::from(5000)),
    );
    ToolDefinition {
        name: "sleep".to_string(),
        description: "Sleeps for the given duration, for exercising timeout handling".to_string(),
        parameter_schema,
        required_params: Vec::new(),
        version: "1.0".to_string(),
        enabled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_echo() -> ToolRegistry {
        let registry = ToolRegistry::new(ToolRegistryConfig::default());
        registry
            .register_tool(echo_tool_definition(), Arc::new(EchoTool))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn echo_tool_round_trips() {
        let registry = registry_with_echo();
        let result = registry
            .execute_tool("echo", serde_json::json!({"message": "hi"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        match &result.content[0] {
            ToolContent::Text { text } => assert_eq!(text, "Echo: hi"),
            _ => panic!("expected text content"),
        }
    }

    #[tokio::test]
    async fn missing_required_param_is_in_band_error() {
        let registry = registry_with_echo();
        let result = registry
            .execute_tool("echo", serde_json::json!({}))
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn unregistered_tool_is_not_found() {
        let registry = registry_with_echo();
        let result = registry.execute_tool("does-not-exist", serde_json::json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrency_cap_is_enforced() {
        let mut config = ToolRegistryConfig::default();
        config.max_concurrent_executions = 0;
        let registry = ToolRegistry::new(config);
        registry
            .register_tool(echo_tool_definition(), Arc::new(EchoTool))
            .unwrap();
        let result = registry
            .execute_tool("echo", serde_json::json!({"message": "hi"}))
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_cap_holds_under_real_concurrency() {
        let mut config = ToolRegistryConfig::default();
        config.max_concurrent_executions = 1;
        let registry = Arc::new(ToolRegistry::new(config));
        registry
            .register_tool(sleep_tool_definition(), Arc::new(SleepTool))
            .unwrap();

        // Spawn several genuinely-parallel callers racing to start the same
        // capped tool; a check-then-increment counter lets more than one
        // past the check before any of them records its increment, but an
        // owned semaphore permit can only ever be handed out once.
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .execute_tool("sleep", serde_json::json!({"duration_ms": 50}))
                    .await
                    .unwrap()
            }));
        }
        let mut accepted = 0;
        let mut rejected = 0;
        for handle in handles {
            if handle.await.unwrap().is_error {
                rejected += 1;
            } else {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1, "only one in-flight execution is allowed at a time");
        assert_eq!(rejected, 7);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = registry_with_echo();
        let err = registry.register_tool(echo_tool_definition(), Arc::new(EchoTool));
        assert!(err.is_err());
    }
}
