//! JSON-RPC 2.0 message types and codec.
//!
//! Mirrors the shape `turbomcp-protocol::jsonrpc` uses, narrowed to what the
//! streaming transport needs: ids are always carried as strings on the wire
//! (numeric ids accepted on input and stringified), and `parse` dispatches on
//! which of `result`/`error`/`id` is present rather than requiring a tagged
//! envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The only JSON-RPC version this codec accepts.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard and server-scoped JSON-RPC error codes (spec.md §4.5/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed JSON was received.
    ParseError,
    /// The JSON sent is not a valid request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// A request other than `initialize` arrived before the connection
    /// finished handshaking.
    NotInitialized,
    /// A second `initialize` arrived on an already-initialized connection.
    AlreadyInitialized,
    /// The client requested an unsupported `protocolVersion`.
    UnsupportedProtocolVersion,
    /// `tools/call` named a tool that isn't registered.
    ToolNotFound,
    /// A registered tool's executor raised before producing a result.
    ToolExecutionFailed,
    /// The request was cancelled or expired before completion.
    Cancelled,
}

impl ErrorCode {
    /// The numeric code placed on the wire.
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::NotInitialized => -32000,
            ErrorCode::AlreadyInitialized => -32001,
            ErrorCode::UnsupportedProtocolVersion => -32002,
            ErrorCode::ToolNotFound => -32003,
            ErrorCode::ToolExecutionFailed => -32004,
            ErrorCode::Cancelled => -32800,
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Build an error from a standard/server-scoped code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A JSON-RPC request: carries an id and expects a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request id, stringified.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC notification: no id, no response expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC response: either a result or an error, never both.
#[derive(Debug, Clone)]
pub struct Response {
    /// Id this response answers.
    pub id: String,
    /// The outcome.
    pub outcome: Outcome,
}

/// Mutually exclusive response payload.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Successful result.
    Result(Value),
    /// Failed with a JSON-RPC error.
    Error(JsonRpcError),
}

impl Response {
    /// Build a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Result(result),
        }
    }

    /// Build an error response.
    pub fn error(id: impl Into<String>, error: JsonRpcError) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Error(error),
        }
    }

    /// Encode to the exact wire shape spec.md §4.5 specifies.
    pub fn encode(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "jsonrpc".to_string(),
            Value::String(JSONRPC_VERSION.to_string()),
        );
        obj.insert("id".to_string(), Value::String(self.id.clone()));
        match &self.outcome {
            Outcome::Result(result) => {
                obj.insert("result".to_string(), result.clone());
            }
            Outcome::Error(err) => {
                obj.insert(
                    "error".to_string(),
                    serde_json::to_value(err).expect("JsonRpcError always serializes"),
                );
            }
        }
        Value::Object(obj)
    }
}

/// A parsed incoming JSON-RPC message.
#[derive(Debug, Clone)]
pub enum Message {
    /// A request awaiting a response.
    Request(Request),
    /// A response to a request this server sent (server-initiated flows).
    Response(Response),
    /// A fire-and-forget notification.
    Notification(Notification),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => write!(f, "request({})", r.method),
            Message::Response(r) => write!(f, "response({})", r.id),
            Message::Notification(n) => write!(f, "notification({})", n.method),
        }
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => None,
        _ => None,
    }
}

/// Parse a single raw JSON-RPC message, dispatching on which of
/// `result`/`error`/`id` is present (spec.md §4.5).
pub fn parse(raw: &Value) -> Result<Message, JsonRpcError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| JsonRpcError::new(ErrorCode::InvalidRequest, "message must be an object"))?;

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(_) => {
            return Err(JsonRpcError::new(
                ErrorCode::InvalidRequest,
                "unsupported jsonrpc version",
            ));
        }
        None => {
            return Err(JsonRpcError::new(
                ErrorCode::InvalidRequest,
                "missing jsonrpc version",
            ));
        }
    }

    if obj.contains_key("result") || obj.contains_key("error") {
        let id = obj
            .get("id")
            .and_then(id_to_string)
            .ok_or_else(|| JsonRpcError::new(ErrorCode::InvalidRequest, "response missing id"))?;
        let outcome = if let Some(err) = obj.get("error") {
            let parsed: JsonRpcError = serde_json::from_value(err.clone()).map_err(|e| {
                JsonRpcError::new(ErrorCode::InvalidRequest, format!("invalid error object: {e}"))
            })?;
            Outcome::Error(parsed)
        } else {
            Outcome::Result(obj.get("result").cloned().unwrap_or(Value::Null))
        };
        return Ok(Message::Response(Response { id, outcome }));
    }

    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::new(ErrorCode::InvalidRequest, "missing method"))?
        .to_string();
    let params = obj.get("params").cloned();

    match obj.get("id") {
        Some(id_value) => {
            let id = id_to_string(id_value).ok_or_else(|| {
                JsonRpcError::new(ErrorCode::InvalidRequest, "id must be a string or number")
            })?;
            Ok(Message::Request(Request { id, method, params }))
        }
        None => Ok(Message::Notification(Notification { method, params })),
    }
}

/// Parse a raw JSON byte slice into one or more messages, supporting both a
/// single object and a batch array (spec.md §6: a leading `[` selects the
/// SSE response mode).
pub fn parse_raw(body: &[u8]) -> Result<Vec<Result<Message, JsonRpcError>>, JsonRpcError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| JsonRpcError::new(ErrorCode::ParseError, format!("invalid JSON: {e}")))?;

    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(JsonRpcError::new(ErrorCode::InvalidRequest, "empty batch"));
            }
            Ok(items.iter().map(parse).collect())
        }
        other => Ok(vec![parse(&other)]),
    }
}

/// `true` iff the raw body, ignoring leading ASCII whitespace, starts a
/// JSON-RPC batch array.
pub fn is_batch(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'[')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_request() {
        let raw = json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{"a":1}});
        let msg = parse(&raw).unwrap();
        match msg {
            Message::Request(r) => {
                assert_eq!(r.id, "1");
                assert_eq!(r.method, "initialize");
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn round_trips_notification() {
        let raw = json!({"jsonrpc":"2.0","method":"initialized"});
        let msg = parse(&raw).unwrap();
        assert!(matches!(msg, Message::Notification(n) if n.method == "initialized"));
    }

    #[test]
    fn encodes_success_response_exactly() {
        let resp = Response::success("1", json!({"ok": true}));
        let encoded = resp.encode();
        assert_eq!(
            encoded,
            json!({"jsonrpc":"2.0","id":"1","result":{"ok":true}})
        );
    }

    #[test]
    fn encodes_error_response_exactly() {
        let resp = Response::error("1", JsonRpcError::new(ErrorCode::MethodNotFound, "nope"));
        let encoded = resp.encode();
        assert_eq!(
            encoded,
            json!({"jsonrpc":"2.0","id":"1","error":{"code":-32601,"message":"nope"}})
        );
    }

    #[test]
    fn rejects_bad_version() {
        let raw = json!({"jsonrpc":"1.0","id":1,"method":"x"});
        let err = parse(&raw).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest.code());
    }

    #[test]
    fn detects_batch_by_leading_bracket() {
        assert!(is_batch(b"  [{}]"));
        assert!(!is_batch(b"{\"a\":1}"));
    }
}
