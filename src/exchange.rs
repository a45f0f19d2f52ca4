//! HTTP Exchange: parsed request metadata plus a write-side state machine
//! for the response (spec.md §4.3).

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::body::{BodyStream, BodyStreamConfig};
use crate::connection::SharedConnection;
use crate::error::{TransportError, TransportResult};

/// Maximum number of headers `httparse` will parse from the request block.
const MAX_HEADERS: usize = 64;

/// Response framing mode, fixed once headers are sent (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Content-Length` framing: exactly one write of known size.
    ContentLength,
    /// HTTP/1.1 chunked transfer-coding.
    Chunked,
    /// `text/event-stream`, never chunk-framed.
    Sse,
}

/// Write-side state machine (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Pending,
    HeadersSent,
    Streaming,
    Ended,
}

/// Parsed request-line and header metadata.
#[derive(Debug, Clone)]
pub struct RequestFields {
    /// HTTP method, e.g. `"GET"`.
    pub method: String,
    /// Request-target as sent on the wire.
    pub uri: String,
    /// Protocol version string, e.g. `"HTTP/1.1"`.
    pub protocol: String,
    /// Headers in wire order; names are not case-normalized on read.
    pub headers: Vec<(String, String)>,
    /// Cookies parsed from the `Cookie` header, if any.
    pub cookies: HashMap<String, String>,
    /// `Content-Length`, or `-1` if absent.
    pub content_length: i64,
}

impl RequestFields {
    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A single HTTP request/response pair multiplexed over a kept-alive
/// connection.
pub struct Exchange {
    conn: SharedConnection,
    bound_addr: SocketAddr,
    pub request: RequestFields,
    body: BodyStream,

    state: ExchangeState,
    framing: Framing,
    response_status: u16,
    response_reason: String,
    response_headers: Vec<(String, String)>,
}

impl Exchange {
    /// Parse `initial_buf` (which must contain the full header block ending
    /// in CRLFCRLF) and construct an exchange bound to `conn`.
    pub fn new(
        conn: SharedConnection,
        initial_buf: &[u8],
        bound_addr: SocketAddr,
        max_uri_length: usize,
        buffer_size: usize,
    ) -> TransportResult<Self> {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut header_storage);
        let status = parsed
            .parse(initial_buf)
            .map_err(|e| TransportError::MalformedRequest(e.to_string()))?;

        let header_len = match status {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                return Err(TransportError::MalformedRequest(
                    "incomplete header block".to_string(),
                ));
            }
        };

        let method = parsed
            .method
            .ok_or_else(|| TransportError::MalformedRequest("missing method".to_string()))?
            .to_string();
        let uri = parsed
            .path
            .ok_or_else(|| TransportError::MalformedRequest("missing URI".to_string()))?
            .to_string();
        if uri.len() > max_uri_length {
            return Err(TransportError::UriTooLong);
        }
        let version = parsed.version.unwrap_or(1);
        let protocol = format!("HTTP/1.{version}");

        let mut headers = Vec::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            if h.name.is_empty() {
                continue;
            }
            let value = String::from_utf8_lossy(h.value).into_owned();
            headers.push((h.name.to_string(), value));
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.trim().parse::<i64>().ok())
            .unwrap_or(-1);

        let cookies = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Cookie"))
            .map(|(_, v)| parse_cookies(v))
            .unwrap_or_default();

        let buffered_body = initial_buf[header_len..].to_vec();

        let body_content_length = if content_length >= 0 {
            Some((content_length as u64).saturating_sub(buffered_body.len() as u64))
        } else {
            None
        };

        let request = RequestFields {
            method,
            uri,
            protocol,
            headers,
            cookies,
            content_length,
        };

        let mut body = BodyStream::new(
            conn.alias(),
            BodyStreamConfig {
                content_length: body_content_length,
                chunked: false,
                buffer_size,
            },
        );
        body.prime_buffered(buffered_body);

        Ok(Self {
            conn,
            bound_addr,
            request,
            body,
            state: ExchangeState::Pending,
            framing: Framing::ContentLength,
            response_status: 200,
            response_reason: "OK".to_string(),
            response_headers: Vec::new(),
        })
    }

    /// The server's bound address, for handlers that need to echo it.
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// The underlying connection, for handlers that need to read/write
    /// outside of the exchange's own helpers (e.g. to start an SSE stream).
    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    /// Read the next chunk of the request body.
    pub async fn read_body_chunk(&mut self) -> TransportResult<Vec<u8>> {
        self.body.read_chunk().await
    }

    /// `true` once the request body has been fully consumed.
    pub fn body_complete(&self) -> bool {
        self.body.is_complete()
    }

    /// Set the response status line. Only legal before headers are sent.
    pub fn set_status(&mut self, code: u16, reason: impl Into<String>) -> TransportResult<()> {
        self.require_pending()?;
        self.response_status = code;
        self.response_reason = reason.into();
        Ok(())
    }

    /// Add a response header. Only legal before headers are sent.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> TransportResult<()> {
        self.require_pending()?;
        self.response_headers.push((name.into(), value.into()));
        Ok(())
    }

    fn require_pending(&self) -> TransportResult<()> {
        if self.state != ExchangeState::Pending {
            return Err(TransportError::InvalidState(
                "headers already sent".to_string(),
            ));
        }
        Ok(())
    }

    /// Send the status line and headers. Idempotent: a second call is a
    /// no-op.
    pub async fn send_headers(&mut self) -> TransportResult<()> {
        if self.state != ExchangeState::Pending {
            return Ok(());
        }
        let mut out = format!(
            "{} {} {}\r\n",
            self.request.protocol, self.response_status, self.response_reason
        );
        for (name, value) in &self.response_headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        self.conn.write_all(out.as_bytes()).await?;
        self.state = ExchangeState::HeadersSent;
        Ok(())
    }

    /// Force SSE response headers and send them, locking framing to `Sse`.
    pub async fn start_sse_stream(&mut self) -> TransportResult<()> {
        self.require_pending()?;
        self.add_header("Content-Type", "text/event-stream")?;
        self.add_header("Cache-Control", "no-cache")?;
        self.add_header("Connection", "keep-alive")?;
        self.framing = Framing::Sse;
        self.send_headers().await
    }

    async fn ensure_streaming(&mut self) -> TransportResult<()> {
        if self.state == ExchangeState::Ended {
            return Err(TransportError::InvalidState("stream already ended".to_string()));
        }
        if self.state == ExchangeState::Pending {
            self.send_headers().await?;
        }
        self.state = ExchangeState::Streaming;
        Ok(())
    }

    fn response_body_writer(&self) -> BodyStream {
        BodyStream::new(
            self.conn.alias(),
            BodyStreamConfig {
                content_length: None,
                chunked: self.framing == Framing::Chunked,
                buffer_size: 8192,
            },
        )
    }

    /// Write one body chunk, sending headers first if still pending.
    pub async fn write_chunk(&mut self, data: &[u8]) -> TransportResult<()> {
        self.ensure_streaming().await?;
        self.response_body_writer().write_chunk(data).await
    }

    /// Write one SSE event, sending headers first if still pending.
    pub async fn write_sse_event(
        &mut self,
        event_type: Option<&str>,
        data: &str,
        id: Option<u64>,
    ) -> TransportResult<()> {
        self.ensure_streaming().await?;
        self.response_body_writer()
            .write_sse_event(event_type, data, id)
            .await
    }

    /// End the response stream. Further writes are errors.
    pub async fn end_stream(&mut self) -> TransportResult<()> {
        if self.state == ExchangeState::Ended {
            return Ok(());
        }
        if self.state == ExchangeState::Pending {
            self.send_headers().await?;
        }
        if self.framing == Framing::Chunked {
            self.response_body_writer().end_stream().await?;
        }
        self.state = ExchangeState::Ended;
        Ok(())
    }

    /// Use chunked transfer-coding framing for the response. Only legal
    /// before headers are sent.
    pub fn use_chunked_framing(&mut self) -> TransportResult<()> {
        self.require_pending()?;
        self.framing = Framing::Chunked;
        self.add_header("Transfer-Encoding", "chunked")
    }

    /// Tear down the underlying connection.
    pub async fn teardown(&self) -> TransportResult<()> {
        self.conn.teardown().await
    }
}

fn parse_cookies(header_value: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for part in cookie::Cookie::split_parse(header_value) {
        if let Ok(c) = part {
            map.insert(c.name().to_string(), c.value().to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, _) = listener.accept().await.unwrap();
        (server, client.await.unwrap())
    }

    #[tokio::test]
    async fn parses_request_line_headers_and_buffered_body() {
        let (server, _client) = connected_pair().await;
        let conn = SharedConnection::accept(server, "127.0.0.1:9".parse().unwrap());
        let raw = b"POST /mcp HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nCookie: a=1; b=2\r\n\r\nhel";
        let exchange = Exchange::new(conn, raw, "127.0.0.1:9".parse().unwrap(), 8192, 4096).unwrap();
        assert_eq!(exchange.request.method, "POST");
        assert_eq!(exchange.request.uri, "/mcp");
        assert_eq!(exchange.request.content_length, 5);
        assert_eq!(exchange.request.cookies.get("a").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn rejects_uri_over_limit() {
        let (server, _client) = connected_pair().await;
        let conn = SharedConnection::accept(server, "127.0.0.1:9".parse().unwrap());
        let raw = b"GET /aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa HTTP/1.1\r\n\r\n";
        let err = Exchange::new(conn, raw, "127.0.0.1:9".parse().unwrap(), 8, 4096).unwrap_err();
        assert!(matches!(err, TransportError::UriTooLong));
    }

    #[tokio::test]
    async fn send_headers_is_idempotent() {
        let (server, mut client) = connected_pair().await;
        let conn = SharedConnection::accept(server, "127.0.0.1:9".parse().unwrap());
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        let mut exchange = Exchange::new(conn, raw, "127.0.0.1:9".parse().unwrap(), 8192, 4096).unwrap();
        exchange.set_status(200, "OK").unwrap();
        exchange.send_headers().await.unwrap();
        exchange.send_headers().await.unwrap();
        drop(exchange);

        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let text = String::from_utf8(buf[..n].to_vec()).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 1);
    }

    #[tokio::test]
    async fn cannot_set_status_after_headers_sent() {
        let (server, _client) = connected_pair().await;
        let conn = SharedConnection::accept(server, "127.0.0.1:9".parse().unwrap());
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        let mut exchange = Exchange::new(conn, raw, "127.0.0.1:9".parse().unwrap(), 8192, 4096).unwrap();
        exchange.send_headers().await.unwrap();
        assert!(exchange.set_status(404, "Not Found").is_err());
    }
}
