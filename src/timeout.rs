//! Timeout Manager: per-request deadlines, progress-based extension, and
//! explicit cancellation for pending JSON-RPC requests (spec.md §4.7).

use std::sync::Arc;

use dashmap::DashMap;

use crate::util::now_ms;

/// Timeout manager configuration.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout applied when a request doesn't specify its own.
    pub default_timeout_ms: u64,
    /// Hard ceiling no request may exceed regardless of progress resets.
    pub maximum_timeout_ms: u64,
    /// Bounds accepted for a progress-reset window.
    pub progress_reset_timeout_range_ms: (u64, u64),
    /// Whether `update_progress` is honored at all.
    pub enable_progress_reset: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            maximum_timeout_ms: 300_000,
            progress_reset_timeout_range_ms: (5_000, 60_000),
            enable_progress_reset: true,
        }
    }
}

/// A JSON-RPC request tracked for timeout and cancellation (spec.md §3).
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub method: String,
    pub start_time_ms: u64,
    pub timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub last_progress_time_ms: u64,
    pub cancelled: bool,
    /// The session this request arrived on, if any — used to route the
    /// `notifications/cancelled` emission on expiry into the right
    /// session's replay buffer (spec.md §5, §9).
    pub session_id: Option<String>,
}

impl PendingRequest {
    /// `cancelled ∨ (now − start ≥ max_timeout_ms) ∨ (now − last_progress ≥ timeout_ms)`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.cancelled
            || now.saturating_sub(self.start_time_ms) >= self.max_timeout_ms
            || now.saturating_sub(self.last_progress_time_ms) >= self.timeout_ms
    }
}

/// Tracks pending JSON-RPC requests across every worker connection.
pub struct TimeoutManager {
    config: TimeoutConfig,
    pending: DashMap<String, PendingRequest>,
    completed_cancelled_at: DashMap<String, u64>,
}

impl TimeoutManager {
    /// Construct a manager with the given configuration.
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            pending: DashMap::new(),
            completed_cancelled_at: DashMap::new(),
        }
    }

    /// Register a pending request. Duplicate ids are ignored.
    pub fn add_request(&self, request_id: &str, method: &str, custom_timeout_ms: Option<u64>) {
        self.add_request_for_session(request_id, method, custom_timeout_ms, None);
    }

    /// Register a pending request tagged with the session it arrived on, so
    /// an expiry can be routed to that session's event stream. Duplicate ids
    /// are ignored.
    pub fn add_request_for_session(
        &self,
        request_id: &str,
        method: &str,
        custom_timeout_ms: Option<u64>,
        session_id: Option<String>,
    ) {
        if self.pending.contains_key(request_id) {
            return;
        }
        let now = now_ms();
        let requested = custom_timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let timeout_ms = requested.min(self.config.maximum_timeout_ms);
        self.pending.insert(
            request_id.to_string(),
            PendingRequest {
                request_id: request_id.to_string(),
                method: method.to_string(),
                start_time_ms: now,
                timeout_ms,
                max_timeout_ms: self.config.maximum_timeout_ms,
                last_progress_time_ms: now,
                cancelled: false,
                session_id,
            },
        );
    }

    /// Reset the per-progress deadline for a request, if progress resets
    /// are enabled. Never extends the hard ceiling.
    pub fn update_progress(&self, request_id: &str) {
        if !self.config.enable_progress_reset {
            return;
        }
        if let Some(mut req) = self.pending.get_mut(request_id) {
            req.last_progress_time_ms = now_ms();
        }
    }

    /// Mark a request cancelled; `is_expired` becomes true immediately.
    pub fn cancel_request(&self, request_id: &str) {
        if let Some(mut req) = self.pending.get_mut(request_id) {
            req.cancelled = true;
        }
    }

    /// Scan for newly expired requests, marking them cancelled, and return
    /// their ids.
    pub fn check_expired_requests(&self) -> Vec<String> {
        let now = now_ms();
        let mut newly_expired = Vec::new();
        for mut entry in self.pending.iter_mut() {
            if !entry.cancelled && entry.is_expired_at(now) {
                entry.cancelled = true;
                newly_expired.push(entry.request_id.clone());
            }
        }
        newly_expired
    }

    /// Stop tracking a completed request.
    pub fn complete_request(&self, request_id: &str) {
        if let Some((_, req)) = self.pending.remove(request_id) {
            if req.cancelled {
                self.completed_cancelled_at.insert(request_id.to_string(), now_ms());
            }
        }
    }

    /// Drop cancelled-and-completed bookkeeping older than 5 minutes.
    pub fn cleanup_completed_requests(&self) {
        let now = now_ms();
        const RETENTION_MS: u64 = 5 * 60 * 1000;
        self.completed_cancelled_at
            .retain(|_, completed_at| now.saturating_sub(*completed_at) < RETENTION_MS);
    }

    /// Snapshot a pending request, if tracked.
    pub fn get(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.get(request_id).map(|r| r.clone())
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

/// Thread-shareable handle.
pub type SharedTimeoutManager = Arc<TimeoutManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_implies_expired() {
        let mgr = TimeoutManager::default();
        mgr.add_request("1", "tools/call", None);
        mgr.cancel_request("1");
        let req = mgr.get("1").unwrap();
        assert!(req.is_expired_at(now_ms()));
    }

    #[test]
    fn exceeding_max_timeout_implies_expired_even_with_fresh_progress() {
        let mgr = TimeoutManager::default();
        mgr.add_request("1", "tools/call", Some(1_000));
        let mut req = mgr.get("1").unwrap();
        req.start_time_ms = now_ms() - 301_000;
        req.last_progress_time_ms = now_ms();
        assert!(req.is_expired_at(now_ms()));
    }

    #[test]
    fn progress_reset_extends_soft_deadline_not_hard_ceiling() {
        let mgr = TimeoutManager::default();
        mgr.add_request("1", "tools/call", Some(100));
        std::thread::sleep(std::time::Duration::from_millis(150));
        // without a progress reset this would already be expired
        assert!(mgr.get("1").unwrap().is_expired_at(now_ms()));
        mgr.update_progress("1");
        assert!(!mgr.get("1").unwrap().is_expired_at(now_ms()));
    }

    #[test]
    fn timeout_is_capped_by_maximum() {
        let mgr = TimeoutManager::default();
        mgr.add_request("1", "tools/call", Some(10_000_000));
        assert_eq!(mgr.get("1").unwrap().timeout_ms, 300_000);
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let mgr = TimeoutManager::default();
        mgr.add_request("1", "tools/call", Some(1000));
        mgr.add_request("1", "tools/call", Some(99999));
        assert_eq!(mgr.get("1").unwrap().timeout_ms, 1000);
    }

    #[test]
    fn session_id_is_carried_onto_the_pending_request() {
        let mgr = TimeoutManager::default();
        mgr.add_request_for_session("1", "tools/call", None, Some("sess-a".to_string()));
        assert_eq!(mgr.get("1").unwrap().session_id.as_deref(), Some("sess-a"));
    }

    #[test]
    fn plain_add_request_leaves_session_id_unset() {
        let mgr = TimeoutManager::default();
        mgr.add_request("1", "tools/call", None);
        assert_eq!(mgr.get("1").unwrap().session_id, None);
    }
}
