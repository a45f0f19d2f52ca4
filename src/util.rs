//! Small neutral helpers shared by the transport and dispatcher layers.
//!
//! spec.md §9 flags that the reference implementation lets the HTTP
//! streaming layer reach into the MCP layer for `hex` and zombie-reaping
//! helpers. Both live here instead, so neither layer depends on the other
//! for plumbing.

use std::time::{SystemTime, UNIX_EPOCH};

/// Lowercase, unpadded hex encoding of a chunk length, as used by HTTP/1.1
/// chunked transfer-coding size lines.
pub fn hex_len(len: usize) -> String {
    format!("{len:x}")
}

/// Current time in milliseconds since the Unix epoch.
///
/// Every duration/deadline computation in the session, timeout, and
/// execution-record data model (spec.md §3) is expressed against this clock.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

/// Reap a spawned child process without blocking the caller.
///
/// tokio already reaps on `Child::wait`/drop, so "zombie reaping" here means
/// driving that wait to completion off to the side instead of leaking a
/// handle. Call sites spawn this as a detached task immediately after
/// killing or expecting a child to exit.
pub async fn reap_child(mut child: tokio::process::Child) {
    if let Err(err) = child.wait().await {
        tracing::warn!(error = %err, "failed to reap child process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_len_is_lowercase_unpadded() {
        assert_eq!(hex_len(0), "0");
        assert_eq!(hex_len(255), "ff");
        assert_eq!(hex_len(16), "10");
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
