//! Streamable HTTP transport, session, and dispatch engine for the Model
//! Context Protocol: accepts keep-alive HTTP/1.1 connections, frames
//! requests and responses (including chunked transfer-coding and SSE),
//! speaks JSON-RPC 2.0, and routes to a registry of executable tools with
//! per-request timeouts and optional out-of-process cancellation.

pub mod body;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod exchange;
pub mod jsonrpc;
pub mod server;
pub mod session;
pub mod timeout;
pub mod tools;
pub mod util;

pub use config::{SecurityConfig, ServerConfig};
pub use dispatcher::{Dispatcher, ServerCapabilities, ServerInfo};
pub use error::{ServerError, ServerResult, TransportError, TransportResult};
pub use server::Server;
pub use session::{SessionConfig, SessionManager, SharedSessionManager};
pub use timeout::{SharedTimeoutManager, TimeoutConfig, TimeoutManager};
pub use tools::{ToolRegistry, ToolRegistryConfig};
