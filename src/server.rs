//! Streaming Server: the accept loop and per-connection keep-alive loop
//! (spec.md §4.4), plus the HTTP-level routing, CORS, and response-mode
//! selection described in spec.md §6.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{SecurityConfig, ServerConfig};
use crate::connection::SharedConnection;
use crate::dispatcher::{CancelReason, Dispatcher};
use crate::error::{TransportError, TransportResult};
use crate::exchange::Exchange;
use crate::jsonrpc::{self, Outcome};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|i| i + HEADER_TERMINATOR.len())
}

/// A connection read/write error whose textual form indicates the peer
/// simply went away, not a real fault (spec.md §4.4).
fn is_clean_close(err: &TransportError) -> bool {
    let text = err.to_string();
    ["EOF", "closed", "invalid descriptor", "not associated with a socket"]
        .iter()
        .any(|needle| text.contains(needle))
}

/// `true` iff `accept` (or its absence) is acceptable for a POST per
/// spec.md §6: either no `Accept` header at all, or one that lists both
/// `application/json` and `text/event-stream` (wildcards satisfy either).
fn accept_is_acceptable(accept: Option<&str>) -> bool {
    let Some(accept) = accept else { return true };
    let accepts_json =
        accept.contains("application/json") || accept.contains("*/*") || accept.contains("application/*");
    let accepts_sse =
        accept.contains("text/event-stream") || accept.contains("*/*") || accept.contains("text/*");
    accepts_json && accepts_sse
}

fn accept_prefers_sse(accept: Option<&str>) -> bool {
    let Some(accept) = accept else { return false };
    match (accept.find("text/event-stream"), accept.find("application/json")) {
        (Some(sse), Some(json)) => sse < json,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Ties the Shared Connection / Body Stream / Exchange transport layer to
/// the MCP Dispatcher, implementing spec.md §4.4's accept-and-keep-alive
/// loop and §6's wire protocol.
pub struct Server {
    config: ServerConfig,
    security: SecurityConfig,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub fn new(config: ServerConfig, security: SecurityConfig, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self { config, security, dispatcher })
    }

    /// Bind the configured address and serve forever.
    pub async fn serve(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.address).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener (used by tests that need an
    /// ephemeral port known ahead of the accept loop starting).
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(address = %self.config.address, name = %self.config.name, "mcp-streaming listening");
        self.spawn_cleanup_task();

        let active = Arc::new(AtomicUsize::new(0));
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };

            if self.config.max_concurrent_connections != 0
                && active.load(Ordering::Acquire) >= self.config.max_concurrent_connections
            {
                drop(stream);
                continue;
            }
            if self.config.tcp_keep_alive {
                let _ = stream.set_nodelay(true);
            }

            let mut conn = SharedConnection::accept(stream, peer_addr);
            let worker_conn = conn.release_ownership();
            // conn (non-owning alias) is dropped here; ownership moves with the worker.

            let server = Arc::clone(&self);
            let active = Arc::clone(&active);
            active.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(async move {
                server.handle_connection(worker_conn).await;
                active.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }

    fn spawn_cleanup_task(self: &Arc<Self>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let expired_sessions = dispatcher.sessions.cleanup_expired_sessions();
                if !expired_sessions.is_empty() {
                    debug!(count = expired_sessions.len(), "swept expired sessions");
                }
                dispatcher.timeouts.cleanup_completed_requests();
                for request_id in dispatcher.timeouts.check_expired_requests() {
                    debug!(request_id, "request expired");
                    let session_id = dispatcher.timeouts.get(&request_id).and_then(|r| r.session_id);
                    if let Some(session_id) = session_id {
                        let notification =
                            Dispatcher::cancelled_notification(&request_id, CancelReason::Timeout);
                        let jsonrpc::Message::Notification(notification) = notification else {
                            unreachable!("cancelled_notification always builds a Notification")
                        };
                        let data = json!({
                            "jsonrpc": jsonrpc::JSONRPC_VERSION,
                            "method": notification.method,
                            "params": notification.params,
                        })
                        .to_string();
                        if let Err(err) =
                            dispatcher
                                .sessions
                                .generate_event_id(&session_id, Some("message".to_string()), data)
                        {
                            warn!(session_id, error = %err, "failed to buffer cancellation notice");
                        }
                    }
                }
            }
        });
    }

    #[instrument(skip(self, conn), fields(connection_id = %conn.id()))]
    async fn handle_connection(self: Arc<Self>, conn: SharedConnection) {
        let connection_id = conn.id();
        let mut buf: Vec<u8> = Vec::new();
        let mut requests_served: u64 = 0;

        loop {
            let header_len = match self.read_headers(&conn, &mut buf).await {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(err) => {
                    if !is_clean_close(&err) {
                        warn!(error = %err, "connection read error");
                    }
                    break;
                }
            };
            let _ = header_len;

            let mut exchange = match Exchange::new(
                conn.alias(),
                &buf,
                conn.peer_addr(),
                self.config.max_request_uri_length,
                self.config.read_buffer_size,
            ) {
                Ok(exchange) => exchange,
                Err(err) => {
                    warn!(error = %err, "malformed request, closing connection");
                    break;
                }
            };
            buf.clear();

            let keep_alive = !exchange
                .request
                .header("Connection")
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false);

            if let Err(err) = self.route(connection_id, &mut exchange).await {
                warn!(error = %err, "request handling failed, closing connection");
                break;
            }

            requests_served += 1;
            if !keep_alive {
                break;
            }
            if self.config.max_requests_per_connection != 0
                && requests_served >= self.config.max_requests_per_connection
            {
                break;
            }
        }

        let _ = conn.teardown().await;
    }

    /// Read into `buf` until the double-CRLF header terminator appears.
    /// `Ok(None)` signals a clean EOF with nothing buffered yet.
    async fn read_headers(&self, conn: &SharedConnection, buf: &mut Vec<u8>) -> TransportResult<Option<usize>> {
        let mut chunk = vec![0u8; self.config.read_buffer_size];
        loop {
            if let Some(pos) = find_header_terminator(buf) {
                return Ok(Some(pos));
            }
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                return if buf.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::Closed)
                };
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn route(&self, connection_id: Uuid, exchange: &mut Exchange) -> TransportResult<()> {
        let method = exchange.request.method.clone();
        let uri = exchange.request.uri.clone();
        let path = uri.split('?').next().unwrap_or("");

        if method == "OPTIONS" {
            exchange.set_status(204, "No Content")?;
            self.add_cors_headers(exchange)?;
            exchange.add_header("Content-Length", "0")?;
            return exchange.end_stream().await;
        }

        match (method.as_str(), path) {
            ("GET", "/health") => self.handle_health(exchange).await,
            ("POST", "/mcp") | ("POST", "/") => self.handle_post(connection_id, exchange).await,
            ("GET", "/mcp") | ("GET", "/sse") => self.handle_sse(connection_id, exchange).await,
            ("GET", _) | ("POST", _) => self.write_error_response(exchange, 404, "Not Found").await,
            _ => self.write_error_response(exchange, 405, "Method Not Allowed").await,
        }
    }

    async fn handle_health(&self, exchange: &mut Exchange) -> TransportResult<()> {
        let body = json!({"status": "healthy", "service": "mcp-streaming"}).to_string();
        exchange.set_status(200, "OK")?;
        exchange.add_header("Content-Type", "application/json")?;
        exchange.add_header("Content-Length", body.len().to_string())?;
        exchange.write_chunk(body.as_bytes()).await?;
        exchange.end_stream().await
    }

    async fn handle_post(&self, connection_id: Uuid, exchange: &mut Exchange) -> TransportResult<()> {
        let content_type_ok = exchange
            .request
            .header("Content-Type")
            .map(|v| v.contains("application/json"))
            .unwrap_or(false);
        if !content_type_ok {
            return self.write_error_response(exchange, 400, "Bad Request").await;
        }
        if let Some(origin) = exchange.request.header("Origin").map(str::to_string) {
            if !self.security.allows(&origin) {
                return self.write_error_response(exchange, 403, "Forbidden").await;
            }
        }
        if !accept_is_acceptable(exchange.request.header("Accept")) {
            return self.write_error_response(exchange, 406, "Not Acceptable").await;
        }

        let mut body = Vec::new();
        loop {
            let piece = exchange.read_body_chunk().await?;
            if piece.is_empty() {
                break;
            }
            body.extend_from_slice(&piece);
            if body.len() as u64 > self.config.max_request_body_size {
                return self.write_error_response(exchange, 413, "Payload Too Large").await;
            }
        }

        let existing_session = exchange.request.header("Mcp-Session-Id").map(str::to_string);
        if let Some(sid) = &existing_session {
            let _ = self.dispatcher.sessions.update_activity(sid);
        }
        let accept = exchange.request.header("Accept").map(str::to_string);
        let is_batch = jsonrpc::is_batch(&body);

        let parsed = jsonrpc::parse_raw(&body);
        let messages = match parsed {
            Ok(messages) => messages,
            Err(err) => {
                let payload = json!({"jsonrpc": "2.0", "id": Value::Null, "error": err});
                let protocol_version = self.dispatcher.protocol_version_for(connection_id);
                return self
                    .write_single_json_response(
                        exchange,
                        existing_session.as_deref(),
                        protocol_version.as_deref(),
                        payload,
                    )
                    .await;
            }
        };

        let mut encoded_responses: Vec<Value> = Vec::new();
        let mut created_session: Option<String> = None;
        for message in messages {
            match message {
                Ok(jsonrpc::Message::Request(request)) => {
                    let is_initialize = request.method == "initialize";
                    let response = self.dispatcher.dispatch_request(connection_id, request).await;
                    if is_initialize
                        && existing_session.is_none()
                        && created_session.is_none()
                        && matches!(response.outcome, Outcome::Result(_))
                    {
                        created_session = Some(self.dispatcher.sessions.create_session(connection_id, None));
                    }
                    encoded_responses.push(response.encode());
                }
                Ok(jsonrpc::Message::Notification(notification)) => {
                    self.dispatcher.dispatch_notification(connection_id, notification).await;
                }
                Ok(jsonrpc::Message::Response(_)) => {
                    // server-initiated request/response flows aren't used by this transport.
                }
                Err(err) => {
                    encoded_responses.push(json!({"jsonrpc": "2.0", "id": Value::Null, "error": err}));
                }
            }
        }

        let session_id = existing_session.or(created_session);
        let protocol_version = self.dispatcher.protocol_version_for(connection_id);

        if encoded_responses.is_empty() {
            exchange.set_status(204, "No Content")?;
            if let Some(sid) = &session_id {
                exchange.add_header("Mcp-Session-Id", sid.clone())?;
            }
            if let Some(v) = &protocol_version {
                exchange.add_header("Mcp-Protocol-Version", v.clone())?;
            }
            self.add_cors_headers(exchange)?;
            exchange.add_header("Content-Length", "0")?;
            return exchange.end_stream().await;
        }

        let body_value = if is_batch {
            Value::Array(encoded_responses)
        } else {
            encoded_responses.into_iter().next().unwrap()
        };

        if is_batch || accept_prefers_sse(accept.as_deref()) {
            self.write_sse_response(
                exchange,
                session_id.as_deref(),
                protocol_version.as_deref(),
                body_value,
            )
            .await
        } else {
            self.write_single_json_response(
                exchange,
                session_id.as_deref(),
                protocol_version.as_deref(),
                body_value,
            )
            .await
        }
    }

    async fn write_single_json_response(
        &self,
        exchange: &mut Exchange,
        session_id: Option<&str>,
        protocol_version: Option<&str>,
        body: Value,
    ) -> TransportResult<()> {
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        exchange.set_status(200, "OK")?;
        exchange.add_header("Content-Type", "application/json")?;
        exchange.add_header("Content-Length", bytes.len().to_string())?;
        if let Some(sid) = session_id {
            exchange.add_header("Mcp-Session-Id", sid.to_string())?;
        }
        if let Some(v) = protocol_version {
            exchange.add_header("Mcp-Protocol-Version", v.to_string())?;
        }
        self.add_cors_headers(exchange)?;
        exchange.write_chunk(&bytes).await?;
        exchange.end_stream().await
    }

    async fn write_sse_response(
        &self,
        exchange: &mut Exchange,
        session_id: Option<&str>,
        protocol_version: Option<&str>,
        body: Value,
    ) -> TransportResult<()> {
        if let Some(sid) = session_id {
            exchange.add_header("Mcp-Session-Id", sid.to_string())?;
        }
        if let Some(v) = protocol_version {
            exchange.add_header("Mcp-Protocol-Version", v.to_string())?;
        }
        self.add_cors_headers(exchange)?;
        exchange.start_sse_stream().await?;

        let data = body.to_string();
        let event_id = session_id.and_then(|sid| {
            self.dispatcher
                .sessions
                .generate_event_id(sid, Some("message".to_string()), data.clone())
                .ok()
                .map(|(id, _)| id)
        });
        exchange.write_sse_event(Some("message"), &data, event_id).await?;
        exchange.end_stream().await
    }

    async fn handle_sse(&self, connection_id: Uuid, exchange: &mut Exchange) -> TransportResult<()> {
        if let Some(origin) = exchange.request.header("Origin").map(str::to_string) {
            if !self.security.allows(&origin) {
                return self.write_error_response(exchange, 403, "Forbidden").await;
            }
        }

        let session_id = match exchange.request.header("Mcp-Session-Id").map(str::to_string) {
            Some(sid) => sid,
            None => self.dispatcher.sessions.create_session(connection_id, None),
        };
        let last_event_id = exchange
            .request
            .header("Last-Event-ID")
            .and_then(|v| v.parse::<u64>().ok());

        exchange.add_header("Mcp-Session-Id", session_id.clone())?;
        self.add_cors_headers(exchange)?;
        exchange.start_sse_stream().await?;

        if let Some(last) = last_event_id {
            let replay = self.dispatcher.sessions.events_after(&session_id, last);
            for event in replay {
                exchange
                    .write_sse_event(event.event_type.as_deref(), &event.data, Some(event.id))
                    .await?;
            }
            exchange.write_sse_event(Some("reconnect"), "{}", None).await?;
        }

        exchange.end_stream().await
    }

    async fn write_error_response(&self, exchange: &mut Exchange, status: u16, reason: &str) -> TransportResult<()> {
        exchange.set_status(status, reason)?;
        self.add_cors_headers(exchange)?;
        exchange.add_header("Content-Length", "0")?;
        exchange.end_stream().await
    }

    fn add_cors_headers(&self, exchange: &mut Exchange) -> TransportResult<()> {
        let origin = exchange
            .request
            .header("Origin")
            .map(str::to_string)
            .unwrap_or_else(|| "*".to_string());
        exchange.add_header("Access-Control-Allow-Origin", origin)?;
        exchange.add_header("Access-Control-Allow-Methods", "POST, OPTIONS")?;
        exchange.add_header(
            "Access-Control-Allow-Headers",
            "Content-Type, Authorization, Mcp-Session-Id",
        )?;
        exchange.add_header("Access-Control-Max-Age", "86400")?;
        exchange.add_header("Cache-Control", "no-cache, no-store, must-revalidate")
    }
}
