//! MCP Dispatcher: the protocol state machine and method router
//! (spec.md §4.8).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::jsonrpc::{ErrorCode, JsonRpcError, Message, Notification, Request, Response};
use crate::session::SharedSessionManager;
use crate::timeout::SharedTimeoutManager;
use crate::tools::ToolRegistry;

/// The only protocol version this dispatcher accepts (spec.md §6).
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Lifecycle state of a single transport connection (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Initializing,
    Ready,
    Error,
}

/// Server identity returned in `initialize` results.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Feature flags the server advertises; capability negotiation is the
/// boolean AND of these with the client's advertised flags (spec.md §4.8,
/// §8).
#[derive(Debug, Clone)]
pub struct ServerCapabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub logging: bool,
    pub roots: bool,
    pub sampling: bool,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            tools: true,
            resources: false,
            prompts: false,
            logging: false,
            roots: false,
            sampling: false,
        }
    }
}

impl ServerCapabilities {
    fn as_map(&self) -> HashMap<&'static str, bool> {
        HashMap::from([
            ("tools", self.tools),
            ("resources", self.resources),
            ("prompts", self.prompts),
            ("logging", self.logging),
            ("roots", self.roots),
            ("sampling", self.sampling),
        ])
    }
}

/// Explicit per-key denials from the client's `capabilities` object. A key
/// that is absent entirely (or the whole object is `{}`/omitted) imposes no
/// constraint — only a key the client sent with a `null` value counts as an
/// explicit "I don't support this" (spec.md §8 scenario 1: an empty client
/// `capabilities: {}` must still negotiate every server-advertised flag on).
fn client_capability_denials(client_capabilities: &Value) -> HashMap<String, bool> {
    client_capabilities
        .as_object()
        .map(|obj| obj.keys().map(|k| (k.clone(), obj[k].is_null())).collect())
        .unwrap_or_default()
}

fn negotiate(server: &ServerCapabilities, client: &Value) -> HashMap<String, bool> {
    let denials = client_capability_denials(client);
    server
        .as_map()
        .into_iter()
        .map(|(k, server_flag)| {
            let denied = denials.get(k).copied().unwrap_or(false);
            (k.to_string(), server_flag && !denied)
        })
        .collect()
}

fn capabilities_to_wire(negotiated: &HashMap<String, bool>) -> Value {
    let mut obj = serde_json::Map::new();
    if negotiated.get("tools").copied().unwrap_or(false) {
        obj.insert("tools".to_string(), json!({ "listChanged": false }));
    }
    for key in ["resources", "prompts", "roots"] {
        if negotiated.get(key).copied().unwrap_or(false) {
            obj.insert(key.to_string(), json!({}));
        }
    }
    for key in ["logging", "sampling"] {
        if negotiated.get(key).copied().unwrap_or(false) {
            obj.insert(key.to_string(), json!({}));
        }
    }
    Value::Object(obj)
}

/// Per-connection MCP protocol state (spec.md §3).
struct McpConnection {
    state: ConnectionState,
    protocol_version: Option<String>,
    client_info: Option<Value>,
    negotiated_capabilities: HashMap<String, bool>,
}

impl Default for McpConnection {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connecting,
            protocol_version: None,
            client_info: None,
            negotiated_capabilities: HashMap::new(),
        }
    }
}

/// Reason recorded on a `notifications/cancelled` emission (spec.md §9).
#[derive(Debug, Clone, Copy)]
pub enum CancelReason {
    Timeout,
    Cancelled,
}

impl CancelReason {
    fn as_str(self) -> &'static str {
        match self {
            CancelReason::Timeout => "timeout",
            CancelReason::Cancelled => "cancelled",
        }
    }
}

/// Routes JSON-RPC messages through the `initialize`/`tools/*` protocol
/// state machine, enforcing spec.md §4.8's connection lifecycle.
pub struct Dispatcher {
    connections: DashMap<Uuid, McpConnection>,
    server_info: ServerInfo,
    server_capabilities: ServerCapabilities,
    pub sessions: SharedSessionManager,
    pub timeouts: SharedTimeoutManager,
    pub tools: Arc<ToolRegistry>,
}

impl Dispatcher {
    pub fn new(
        server_info: ServerInfo,
        server_capabilities: ServerCapabilities,
        sessions: SharedSessionManager,
        timeouts: SharedTimeoutManager,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            server_info,
            server_capabilities,
            sessions,
            timeouts,
            tools,
        }
    }

    fn connection_state(&self, connection_id: Uuid) -> ConnectionState {
        self.connections
            .get(&connection_id)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Connecting)
    }

    /// The protocol version negotiated during `initialize`, if this
    /// connection has completed a handshake — used to echo
    /// `Mcp-Protocol-Version` on subsequent responses (SPEC_FULL.md
    /// "ambient stack" supplement).
    pub fn protocol_version_for(&self, connection_id: Uuid) -> Option<String> {
        self.connections.get(&connection_id)?.protocol_version.clone()
    }

    /// Dispatch a single request. Always produces a response (possibly a
    /// protocol error); tool failures are reported in-band, never as a
    /// JSON-RPC error (spec.md §7).
    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn dispatch_request(&self, connection_id: Uuid, request: Request) -> Response {
        if request.method != "initialize" && self.connection_state(connection_id) != ConnectionState::Ready
        {
            return Response::error(
                &request.id,
                JsonRpcError::new(ErrorCode::NotInitialized, "server not initialized"),
            );
        }

        match request.method.as_str() {
            "initialize" => self.handle_initialize(connection_id, request).await,
            "tools/list" => self.handle_tools_list(request),
            "tools/call" => self.handle_tools_call(connection_id, request).await,
            m if m.starts_with("resources/") || m.starts_with("prompts/") => Response::error(
                &request.id,
                JsonRpcError::new(ErrorCode::MethodNotFound, format!("{m} is not implemented")),
            ),
            other => Response::error(
                &request.id,
                JsonRpcError::new(ErrorCode::MethodNotFound, format!("unknown method '{other}'")),
            ),
        }
    }

    /// Handle a notification. Never produces a response.
    #[instrument(skip(self, notification), fields(method = %notification.method))]
    pub async fn dispatch_notification(&self, connection_id: Uuid, notification: Notification) {
        match notification.method.as_str() {
            "initialized" => {
                if let Some(mut conn) = self.connections.get_mut(&connection_id) {
                    conn.state = ConnectionState::Ready;
                }
            }
            "notifications/progress" => {
                if let Some(request_id) = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .and_then(|v| v.as_str())
                {
                    self.timeouts.update_progress(request_id);
                }
            }
            "notifications/cancelled" => {
                if let Some(request_id) = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .and_then(|v| v.as_str())
                {
                    self.timeouts.cancel_request(request_id);
                }
            }
            other => {
                warn!(method = %other, "ignoring unsupported notification");
            }
        }
    }

    async fn handle_initialize(&self, connection_id: Uuid, request: Request) -> Response {
        let state = self.connection_state(connection_id);
        if matches!(state, ConnectionState::Initializing | ConnectionState::Ready) {
            return Response::error(
                &request.id,
                JsonRpcError::new(ErrorCode::AlreadyInitialized, "already initialized"),
            );
        }

        let params = request.params.clone().unwrap_or(Value::Null);
        let protocol_version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if protocol_version != PROTOCOL_VERSION {
            return Response::error(
                &request.id,
                JsonRpcError::new(
                    ErrorCode::UnsupportedProtocolVersion,
                    format!("Unsupported protocol version: {protocol_version}"),
                ),
            );
        }

        let client_capabilities = params.get("capabilities").cloned().unwrap_or(Value::Null);
        let negotiated = negotiate(&self.server_capabilities, &client_capabilities);
        let client_info = params.get("clientInfo").cloned();

        self.connections.insert(
            connection_id,
            McpConnection {
                state: ConnectionState::Initializing,
                protocol_version: Some(protocol_version.clone()),
                client_info: client_info.clone(),
                negotiated_capabilities: negotiated.clone(),
            },
        );

        let result = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": capabilities_to_wire(&negotiated),
            "serverInfo": {
                "name": self.server_info.name,
                "version": self.server_info.version,
            }
        });
        Response::success(&request.id, result)
    }

    fn handle_tools_list(&self, request: Request) -> Response {
        let tools: Vec<Value> = self
            .tools
            .list_definitions()
            .iter()
            .map(|t| t.to_list_entry())
            .collect();
        Response::success(&request.id, json!({ "tools": tools }))
    }

    async fn handle_tools_call(&self, connection_id: Uuid, request: Request) -> Response {
        let params = request.params.clone().unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Response::error(
                &request.id,
                JsonRpcError::new(ErrorCode::InvalidParams, "missing 'name'"),
            );
        };
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let session_id = self.sessions.session_for_connection(connection_id);
        self.timeouts
            .add_request_for_session(&request.id, "tools/call", None, session_id);
        let outcome = self.tools.execute_tool(name, arguments).await;
        self.timeouts.complete_request(&request.id);

        match outcome {
            Ok(result) => Response::success(&request.id, serde_json::to_value(result).unwrap()),
            Err(_not_found) => Response::error(
                &request.id,
                JsonRpcError::new(ErrorCode::ToolNotFound, format!("tool '{name}' not found")),
            ),
        }
    }

    /// Build the `notifications/cancelled` notification body for a request
    /// that expired or was explicitly cancelled (spec.md §5, §9).
    pub fn cancelled_notification(request_id: &str, reason: CancelReason) -> Message {
        Message::Notification(Notification {
            method: "notifications/cancelled".to_string(),
            params: Some(json!({ "requestId": request_id, "reason": reason.as_str() })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;
    use crate::timeout::TimeoutManager;
    use crate::tools::{echo_tool_definition, EchoTool, ToolRegistry, ToolRegistryConfig};
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let registry = ToolRegistry::new(ToolRegistryConfig::default());
        registry
            .register_tool(echo_tool_definition(), Arc::new(EchoTool))
            .unwrap();
        Dispatcher::new(
            ServerInfo { name: "s".into(), version: "1.0".into() },
            ServerCapabilities::default(),
            Arc::new(SessionManager::default()),
            Arc::new(TimeoutManager::default()),
            Arc::new(registry),
        )
    }

    #[tokio::test]
    async fn happy_initialize_matches_spec_shape() {
        let dispatcher = dispatcher();
        let connection_id = Uuid::new_v4();
        let request = Request {
            id: "1".to_string(),
            method: "initialize".to_string(),
            params: Some(json!({
                "protocolVersion": "2025-06-18",
                "clientInfo": {"name": "c", "version": "1.0"},
                "capabilities": {}
            })),
        };
        let response = dispatcher.dispatch_request(connection_id, request).await;
        let encoded = response.encode();
        assert_eq!(
            encoded,
            json!({
                "jsonrpc":"2.0","id":"1",
                "result": {
                    "protocolVersion":"2025-06-18",
                    "capabilities":{"tools":{"listChanged":false}},
                    "serverInfo":{"name":"s","version":"1.0"}
                }
            })
        );
    }

    #[test]
    fn negotiate_keeps_server_flag_when_client_omits_the_key() {
        let negotiated = negotiate(&ServerCapabilities::default(), &json!({}));
        assert_eq!(negotiated.get("tools"), Some(&true));
    }

    #[test]
    fn negotiate_honors_an_explicit_client_denial() {
        let negotiated = negotiate(&ServerCapabilities::default(), &json!({ "tools": null }));
        assert_eq!(negotiated.get("tools"), Some(&false));
    }

    #[tokio::test]
    async fn version_mismatch_is_dash_32002() {
        let dispatcher = dispatcher();
        let connection_id = Uuid::new_v4();
        let request = Request {
            id: "1".to_string(),
            method: "initialize".to_string(),
            params: Some(json!({
                "protocolVersion": "2024-01-01",
                "clientInfo": {"name": "c", "version": "1.0"},
                "capabilities": {}
            })),
        };
        let response = dispatcher.dispatch_request(connection_id, request).await;
        match response.outcome {
            crate::jsonrpc::Outcome::Error(err) => assert_eq!(err.code, -32002),
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn request_before_initialize_is_not_initialized() {
        let dispatcher = dispatcher();
        let connection_id = Uuid::new_v4();
        let request = Request {
            id: "1".to_string(),
            method: "tools/list".to_string(),
            params: None,
        };
        let response = dispatcher.dispatch_request(connection_id, request).await;
        match response.outcome {
            crate::jsonrpc::Outcome::Error(err) => assert_eq!(err.code, -32000),
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn second_initialize_fails_strict() {
        let dispatcher = dispatcher();
        let connection_id = Uuid::new_v4();
        let make = || Request {
            id: "1".to_string(),
            method: "initialize".to_string(),
            params: Some(json!({
                "protocolVersion": "2025-06-18",
                "clientInfo": {"name": "c", "version": "1.0"},
                "capabilities": {}
            })),
        };
        dispatcher.dispatch_request(connection_id, make()).await;
        let second = dispatcher.dispatch_request(connection_id, make()).await;
        match second.outcome {
            crate::jsonrpc::Outcome::Error(err) => assert_eq!(err.code, -32001),
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn tools_call_after_ready_echoes() {
        let dispatcher = dispatcher();
        let connection_id = Uuid::new_v4();
        dispatcher
            .dispatch_request(
                connection_id,
                Request {
                    id: "1".to_string(),
                    method: "initialize".to_string(),
                    params: Some(json!({
                        "protocolVersion": "2025-06-18",
                        "clientInfo": {"name": "c", "version": "1.0"},
                        "capabilities": {}
                    })),
                },
            )
            .await;
        dispatcher
            .dispatch_notification(
                connection_id,
                Notification { method: "initialized".to_string(), params: None },
            )
            .await;
        let response = dispatcher
            .dispatch_request(
                connection_id,
                Request {
                    id: "2".to_string(),
                    method: "tools/call".to_string(),
                    params: Some(json!({"name": "echo", "arguments": {"message": "hi"}})),
                },
            )
            .await;
        match response.outcome {
            crate::jsonrpc::Outcome::Result(result) => {
                assert_eq!(result["content"][0]["text"], "Echo: hi");
            }
            _ => panic!("expected result"),
        }
    }

    #[tokio::test]
    async fn tools_call_tags_its_pending_request_with_the_connection_session() {
        let dispatcher = dispatcher();
        let connection_id = Uuid::new_v4();
        let session_id = dispatcher.sessions.create_session(connection_id, None);
        dispatcher
            .dispatch_request(
                connection_id,
                Request {
                    id: "1".to_string(),
                    method: "initialize".to_string(),
                    params: Some(json!({
                        "protocolVersion": "2025-06-18",
                        "clientInfo": {"name": "c", "version": "1.0"},
                        "capabilities": {}
                    })),
                },
            )
            .await;
        dispatcher
            .dispatch_notification(
                connection_id,
                Notification { method: "initialized".to_string(), params: None },
            )
            .await;

        // tools/call looks up session_for_connection(connection_id) to tag
        // its pending request; confirm that lookup resolves for a
        // session created on this connection before the handshake.
        assert_eq!(dispatcher.sessions.session_for_connection(connection_id), Some(session_id));
    }

    #[tokio::test]
    async fn resources_and_prompts_are_not_implemented() {
        let dispatcher = dispatcher();
        let connection_id = Uuid::new_v4();
        dispatcher
            .dispatch_request(
                connection_id,
                Request {
                    id: "1".to_string(),
                    method: "initialize".to_string(),
                    params: Some(json!({
                        "protocolVersion": "2025-06-18",
                        "clientInfo": {"name": "c", "version": "1.0"},
                        "capabilities": {}
                    })),
                },
            )
            .await;
        dispatcher
            .dispatch_notification(
                connection_id,
                Notification { method: "initialized".to_string(), params: None },
            )
            .await;
        let response = dispatcher
            .dispatch_request(
                connection_id,
                Request { id: "2".to_string(), method: "resources/list".to_string(), params: None },
            )
            .await;
        match response.outcome {
            crate::jsonrpc::Outcome::Error(err) => assert_eq!(err.code, -32601),
            _ => panic!("expected error"),
        }
    }
}
