//! Body Stream: chunked-aware reader/writer bound to a connection
//! (spec.md §4.2).

use crate::connection::SharedConnection;
use crate::error::TransportResult;
use crate::util::hex_len;

/// Configuration for a single request/response body.
#[derive(Debug, Clone, Copy)]
pub struct BodyStreamConfig {
    /// `Some(n)` for a known `Content-Length`; `None` when unknown (read
    /// until EOF, or a streaming write).
    pub content_length: Option<u64>,
    /// Whether writes should be chunk-framed.
    pub chunked: bool,
    /// Read buffer size.
    pub buffer_size: usize,
}

/// Reads and writes an HTTP message body over a [`SharedConnection`].
pub struct BodyStream {
    conn: SharedConnection,
    content_length: Option<u64>,
    bytes_read: u64,
    chunked: bool,
    buffer_size: usize,
    complete: bool,
    buffered_prefix: std::collections::VecDeque<u8>,
}

impl BodyStream {
    /// Construct a body stream bound to `conn`.
    pub fn new(conn: SharedConnection, config: BodyStreamConfig) -> Self {
        Self {
            conn,
            content_length: config.content_length,
            bytes_read: 0,
            chunked: config.chunked,
            buffer_size: config.buffer_size.max(1),
            complete: false,
            buffered_prefix: std::collections::VecDeque::new(),
        }
    }

    /// Seed bytes that were already read off the wire (e.g. body bytes that
    /// trailed the header block in the initial read buffer) so they are
    /// drained before any further socket reads.
    pub fn prime_buffered(&mut self, bytes: Vec<u8>) {
        self.buffered_prefix.extend(bytes);
    }

    /// `true` once the body has been fully read (or, for unknown length,
    /// once EOF has been observed).
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Read the next chunk of the body. Returns an empty vector once the
    /// body is complete.
    pub async fn read_chunk(&mut self) -> TransportResult<Vec<u8>> {
        if self.complete {
            return Ok(Vec::new());
        }

        if !self.buffered_prefix.is_empty() {
            let take = self.buffered_prefix.len().min(self.buffer_size);
            let chunk: Vec<u8> = self.buffered_prefix.drain(..take).collect();
            if chunk.is_empty() {
                self.complete = true;
                return Ok(Vec::new());
            }
            return Ok(chunk);
        }

        let want = match self.content_length {
            Some(total) => {
                let remaining = total.saturating_sub(self.bytes_read);
                if remaining == 0 {
                    self.complete = true;
                    return Ok(Vec::new());
                }
                remaining.min(self.buffer_size as u64) as usize
            }
            None => self.buffer_size,
        };

        let mut buf = vec![0u8; want];
        let n = self.conn.read(&mut buf).await?;
        if n == 0 {
            // EOF: only a true completion signal when length is unknown.
            self.complete = true;
            return Ok(Vec::new());
        }
        buf.truncate(n);
        self.bytes_read += n as u64;
        if let Some(total) = self.content_length {
            if self.bytes_read >= total {
                self.complete = true;
            }
        }
        Ok(buf)
    }

    /// Write one body chunk. Chunk-framed if `chunked` was configured.
    pub async fn write_chunk(&self, data: &[u8]) -> TransportResult<()> {
        if !self.chunked {
            self.conn.write_all(data).await?;
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut framed = Vec::with_capacity(data.len() + 16);
        framed.extend_from_slice(hex_len(data.len()).as_bytes());
        framed.extend_from_slice(b"\r\n");
        framed.extend_from_slice(data);
        framed.extend_from_slice(b"\r\n");
        self.conn.write_all(&framed).await
    }

    /// Emit the terminal zero-length chunk, if chunk-framed.
    pub async fn end_stream(&self) -> TransportResult<()> {
        if self.chunked {
            self.conn.write_all(b"0\r\n\r\n").await?;
        }
        Ok(())
    }

    /// Write a single SSE event. Never chunk-framed, regardless of how this
    /// stream was configured (spec.md §4.2).
    pub async fn write_sse_event(
        &self,
        event_type: Option<&str>,
        data: &str,
        id: Option<u64>,
    ) -> TransportResult<()> {
        let mut out = String::new();
        if let Some(t) = event_type {
            out.push_str("event: ");
            out.push_str(t);
            out.push('\n');
        }
        if let Some(id) = id {
            out.push_str("id: ");
            out.push_str(&id.to_string());
            out.push('\n');
        }
        for line in data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        self.conn.write_all(out.as_bytes()).await
    }
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
    async fn chunked_write_round_trips_through_deframing() {
        let (server, mut client) = connected_pair().await;
        let conn = SharedConnection::accept(server, "127.0.0.1:1".parse().unwrap());
        let body = BodyStream::new(
            conn,
            BodyStreamConfig {
                content_length: None,
                chunked: true,
                buffer_size: 4096,
            },
        );
        body.write_chunk(b"hello, ").await.unwrap();
        body.write_chunk(b"world").await.unwrap();
        body.end_stream().await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut raw = vec![0u8; 256];
        let n = client.read(&mut raw).await.unwrap();
        let raw = &raw[..n];
        assert_eq!(raw, b"7\r\nhello, \r\n5\r\nworld\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn sse_event_has_trailing_blank_line_for_multiline_data() {
        let (server, mut client) = connected_pair().await;
        let conn = SharedConnection::accept(server, "127.0.0.1:1".parse().unwrap());
        let body = BodyStream::new(
            conn,
            BodyStreamConfig {
                content_length: None,
                chunked: true,
                buffer_size: 4096,
            },
        );
        body.write_sse_event(Some("message"), "line1\nline2\n", Some(7))
            .await
            .unwrap();

        use tokio::io::AsyncReadExt;
        let mut raw = vec![0u8; 256];
        let n = client.read(&mut raw).await.unwrap();
        let text = String::from_utf8(raw[..n].to_vec()).unwrap();
        assert_eq!(
            text,
            "event: message\nid: 7\ndata: line1\ndata: line2\ndata: \n\n"
        );
    }

    #[tokio::test]
    async fn read_chunk_respects_content_length() {
        let (server, mut client) = connected_pair().await;
        use tokio::io::AsyncWriteExt;
        client.write_all(b"hello world extra").await.unwrap();

        let conn = SharedConnection::accept(server, "127.0.0.1:1".parse().unwrap());
        let mut body = BodyStream::new(
            conn,
            BodyStreamConfig {
                content_length: Some(5),
                chunked: false,
                buffer_size: 4096,
            },
        );
        let chunk = body.read_chunk().await.unwrap();
        assert_eq!(chunk, b"hello");
        assert!(body.is_complete());
        let next = body.read_chunk().await.unwrap();
        assert!(next.is_empty());
    }
}
