//! Session Manager: session lifecycle, activity tracking, and SSE event-id
//! assignment (spec.md §4.6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ServerError, ServerResult};
use crate::util::now_ms;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Receiving traffic within its timeout window.
    Active,
    /// Idle past `timeout_duration_ms`; eligible for removal.
    Expired,
    /// Explicitly terminated; never resurrected.
    Terminated,
}

/// A buffered SSE event, kept for `Last-Event-ID` replay (spec.md §3).
#[derive(Debug, Clone)]
pub struct SseEventRecord {
    /// Monotonic, dense-within-session event id.
    pub id: u64,
    /// SSE `event:` field, if any.
    pub event_type: Option<String>,
    /// SSE `data:` payload.
    pub data: String,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle duration after which a session is considered expired.
    pub timeout_duration_ms: u64,
    /// Minimum interval between `cleanup_expired_sessions` sweeps.
    pub cleanup_interval_ms: u64,
    /// Max buffered SSE events retained per session, oldest evicted first.
    pub replay_buffer_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_duration_ms: 30 * 60 * 1000,
            cleanup_interval_ms: 5 * 60 * 1000,
            replay_buffer_capacity: 1000,
        }
    }
}

/// A session: logical client<->server affinity keyed by an opaque id.
pub struct Session {
    pub session_id: String,
    pub connection_id: Uuid,
    pub state: SessionState,
    pub created_at: u64,
    pub last_activity: u64,
    pub timeout_duration_ms: u64,
    pub client_info: Option<Value>,
    next_event_id: AtomicU64,
    events: std::collections::VecDeque<SseEventRecord>,
    replay_buffer_capacity: usize,
}

impl Session {
    fn new(connection_id: Uuid, client_info: Option<Value>, config: &SessionConfig) -> Self {
        let now = now_ms();
        Self {
            session_id: Uuid::new_v4().to_string(),
            connection_id,
            state: SessionState::Active,
            created_at: now,
            last_activity: now,
            timeout_duration_ms: config.timeout_duration_ms,
            client_info,
            next_event_id: AtomicU64::new(1),
            events: std::collections::VecDeque::new(),
            replay_buffer_capacity: config.replay_buffer_capacity,
        }
    }

    /// Allocate the next event id and buffer a record for replay, evicting
    /// the oldest entry if the buffer is full.
    fn record_event(&mut self, event_type: Option<String>, data: String) -> u64 {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        if self.events.len() >= self.replay_buffer_capacity {
            self.events.pop_front();
        }
        self.events.push_back(SseEventRecord { id, event_type, data });
        id
    }

    /// Buffered events with `id > last_event_id`, in ascending order.
    pub fn events_after(&self, last_event_id: u64) -> Vec<SseEventRecord> {
        self.events
            .iter()
            .filter(|e| e.id > last_event_id)
            .cloned()
            .collect()
    }

    fn is_expired(&self, now: u64) -> bool {
        matches!(self.state, SessionState::Terminated)
            || now.saturating_sub(self.last_activity) > self.timeout_duration_ms
    }
}

/// Owns all sessions for this process (spec.md §5: per-worker in the
/// reference fork design; here, a single shared instance guarded by
/// lock-free maps, since this runtime has one address space).
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    by_connection: DashMap<Uuid, String>,
    config: SessionConfig,
    last_cleanup: std::sync::atomic::AtomicU64,
}

impl SessionManager {
    /// Construct a manager with the given configuration.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            by_connection: DashMap::new(),
            config,
            last_cleanup: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Create and register a new session, returning its id.
    pub fn create_session(&self, connection_id: Uuid, client_info: Option<Value>) -> String {
        let session = Session::new(connection_id, client_info, &self.config);
        let id = session.session_id.clone();
        self.by_connection.insert(connection_id, id.clone());
        self.sessions.insert(id.clone(), session);
        id
    }

    /// Refresh `last_activity` for a session.
    pub fn update_activity(&self, session_id: &str) -> ServerResult<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ServerError::session(format!("unknown session {session_id}")))?;
        session.last_activity = now_ms();
        Ok(())
    }

    /// Look up a session id, failing if missing.
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// The session affiliated with a connection, if one was created on it.
    pub fn session_for_connection(&self, connection_id: Uuid) -> Option<String> {
        self.by_connection.get(&connection_id).map(|id| id.clone())
    }

    /// Allocate the next SSE event id for a session and buffer the event
    /// for replay. Format: `"<session_id>-<n>"`.
    pub fn generate_event_id(
        &self,
        session_id: &str,
        event_type: Option<String>,
        data: String,
    ) -> ServerResult<(u64, String)> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ServerError::session(format!("unknown session {session_id}")))?;
        let id = session.record_event(event_type, data);
        Ok((id, format!("{session_id}-{id}")))
    }

    /// Events buffered for `session_id` with id greater than `last_event_id`.
    pub fn events_after(&self, session_id: &str, last_event_id: u64) -> Vec<SseEventRecord> {
        self.sessions
            .get(session_id)
            .map(|s| s.events_after(last_event_id))
            .unwrap_or_default()
    }

    /// Terminate a session. Idempotent: terminating an already-terminated
    /// or missing session is a no-op.
    pub fn terminate_session(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            self.by_connection.remove(&session.connection_id);
        }
    }

    /// Sweep idle/terminated sessions, at most once per
    /// `cleanup_interval_ms`. Returns the ids removed.
    pub fn cleanup_expired_sessions(&self) -> Vec<String> {
        let now = now_ms();
        let last = self.last_cleanup.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.config.cleanup_interval_ms {
            return Vec::new();
        }
        self.last_cleanup.store(now, Ordering::Release);

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.terminate_session(id);
        }
        expired
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

/// Thread-shareable handle, matching how the dispatcher passes managers
/// into worker tasks.
pub type SharedSessionManager = Arc<SessionManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_are_strictly_monotonic() {
        let mgr = SessionManager::default();
        let sid = mgr.create_session(Uuid::new_v4(), None);
        let (id1, _) = mgr.generate_event_id(&sid, None, "a".into()).unwrap();
        let (id2, _) = mgr.generate_event_id(&sid, None, "b".into()).unwrap();
        let (id3, _) = mgr.generate_event_id(&sid, None, "c".into()).unwrap();
        assert_eq!((id1, id2, id3), (1, 2, 3));
    }

    #[test]
    fn replay_returns_events_after_last_event_id_in_order() {
        let mgr = SessionManager::default();
        let sid = mgr.create_session(Uuid::new_v4(), None);
        for i in 0..5 {
            mgr.generate_event_id(&sid, None, format!("payload-{i}")).unwrap();
        }
        let replay = mgr.events_after(&sid, 3);
        let ids: Vec<u64> = replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn replay_buffer_evicts_oldest_first() {
        let mut config = SessionConfig::default();
        config.replay_buffer_capacity = 2;
        let mgr = SessionManager::new(config);
        let sid = mgr.create_session(Uuid::new_v4(), None);
        mgr.generate_event_id(&sid, None, "a".into()).unwrap();
        mgr.generate_event_id(&sid, None, "b".into()).unwrap();
        mgr.generate_event_id(&sid, None, "c".into()).unwrap();
        let replay = mgr.events_after(&sid, 0);
        let ids: Vec<u64> = replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn session_for_connection_resolves_back_to_its_owner() {
        let mgr = SessionManager::default();
        let connection_id = Uuid::new_v4();
        let sid = mgr.create_session(connection_id, None);
        assert_eq!(mgr.session_for_connection(connection_id), Some(sid));
        assert_eq!(mgr.session_for_connection(Uuid::new_v4()), None);
    }

    #[test]
    fn terminate_is_idempotent() {
        let mgr = SessionManager::default();
        let sid = mgr.create_session(Uuid::new_v4(), None);
        mgr.terminate_session(&sid);
        mgr.terminate_session(&sid);
        assert!(!mgr.has_session(&sid));
    }
}
