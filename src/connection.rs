//! Shared Connection: safe ownership transfer of an accepted socket from the
//! accept loop to its worker, plus a single point of teardown (spec.md §4.1).
//!
//! The reference design hands the socket to a forked worker and forgets it.
//! tokio has no fork, so ownership transfer is modeled explicitly: exactly
//! one handle has `is_owner == true` at a time, and `teardown` is a no-op on
//! every other handle. The accept loop still gets to keep a non-owning alias
//! around if it ever needs one, without being able to close the socket out
//! from under the worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};

/// A reference-counted handle over an accepted socket.
#[derive(Clone)]
pub struct SharedConnection {
    id: Uuid,
    peer_addr: SocketAddr,
    io: Arc<AsyncMutex<Option<TcpStream>>>,
    torn_down: Arc<AtomicBool>,
    is_owner: bool,
}

impl SharedConnection {
    /// Wrap a freshly accepted socket. The returned handle is the owner.
    pub fn accept(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            io: Arc::new(AsyncMutex::new(Some(stream))),
            torn_down: Arc::new(AtomicBool::new(false)),
            is_owner: true,
        }
    }

    /// Connection identifier, stable across ownership handoffs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The peer's socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// `true` if this handle currently holds ownership.
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Produce a non-owning alias. The alias may read/write but
    /// `teardown` on it is always a no-op.
    pub fn alias(&self) -> Self {
        Self {
            id: self.id,
            peer_addr: self.peer_addr,
            io: Arc::clone(&self.io),
            torn_down: Arc::clone(&self.torn_down),
            is_owner: false,
        }
    }

    /// Hand ownership to a new handle (to be moved into the worker), and
    /// downgrade `self` to a non-owning alias. Mirrors the accept loop
    /// forking off a worker and then releasing its own reference.
    pub fn release_ownership(&mut self) -> Self {
        let new_owner = Self {
            id: self.id,
            peer_addr: self.peer_addr,
            io: Arc::clone(&self.io),
            torn_down: Arc::clone(&self.torn_down),
            is_owner: true,
        };
        self.is_owner = false;
        new_owner
    }

    /// Read up to `buf.len()` bytes. Returns `Ok(0)` on EOF.
    pub async fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        let mut guard = self.io.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::Closed)?;
        Ok(stream.read(buf).await?)
    }

    /// Write the full buffer to the socket.
    pub async fn write_all(&self, buf: &[u8]) -> TransportResult<()> {
        let mut guard = self.io.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::Closed)?;
        stream.write_all(buf).await?;
        Ok(())
    }

    /// Tear down the connection. A no-op on non-owning handles and on a
    /// handle that has already torn down (idempotent).
    pub async fn teardown(&self) -> TransportResult<()> {
        if !self.is_owner {
            return Ok(());
        }
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut guard = self.io.lock().await;
        if let Some(stream) = guard.take() {
            let _ = stream.into_std().map(|s| s.shutdown(std::net::Shutdown::Both));
        }
        Ok(())
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
    async fn teardown_is_noop_on_alias() {
        let (server, _client) = connected_pair().await;
        let mut conn = SharedConnection::accept(server, "127.0.0.1:1".parse().unwrap());
        let worker_conn = conn.release_ownership();
        assert!(!conn.is_owner());
        assert!(worker_conn.is_owner());
        // tearing down the released parent handle must not close the socket
        conn.teardown().await.unwrap();
        assert!(worker_conn.write_all(b"ping").await.is_ok());
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (server, _client) = connected_pair().await;
        let conn = SharedConnection::accept(server, "127.0.0.1:1".parse().unwrap());
        conn.teardown().await.unwrap();
        conn.teardown().await.unwrap();
    }
}
