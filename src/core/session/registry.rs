//! Concurrency-safe directory of active call sessions.
//!
//! Lookups and status queries take the read lock; insert/remove are the
//! only writers. Event senders are cloned out of the lock before any
//! await so the lock is never held across a suspension point.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::session_event::SessionEvent;
use super::state::CallState;

/// Status snapshot kept current by the session's own loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub instance_id: String,
    pub scenario_id: String,
    pub state: CallState,
    pub turn: u32,
    pub caller_number: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Shared per-session handle: the event queue entrance plus the flags
/// other components may flip without entering the session loop.
pub struct SessionHandle {
    pub session_id: String,
    pub instance_id: String,
    events: mpsc::Sender<SessionEvent>,
    /// Set before the hangup event is enqueued so a queued non-hangup
    /// event can never act after the switch reported the leg gone.
    pub hangup_seen: AtomicBool,
    /// Set while the instance's event socket is down.
    pub degraded: AtomicBool,
    snapshot: parking_lot::RwLock<SessionSnapshot>,
}

impl SessionHandle {
    pub fn new(
        session_id: String,
        instance_id: String,
        events: mpsc::Sender<SessionEvent>,
        snapshot: SessionSnapshot,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            instance_id,
            events,
            hangup_seen: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            snapshot: parking_lot::RwLock::new(snapshot),
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    pub fn update_snapshot(&self, state: CallState, turn: u32) {
        let mut snapshot = self.snapshot.write();
        snapshot.state = state;
        snapshot.turn = turn;
    }

    pub async fn send(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "event dropped, session loop gone");
        }
    }
}

/// The live-session directory. Sessions are inserted at creation and only
/// removed by their own loop after reaching the terminal state.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: parking_lot::RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, handle: Arc<SessionHandle>) {
        let mut sessions = self.sessions.write();
        if sessions
            .insert(handle.session_id.clone(), handle.clone())
            .is_some()
        {
            warn!(session_id = %handle.session_id, "replaced existing session handle");
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.write().remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .values()
            .map(|handle| handle.snapshot())
            .collect()
    }

    /// Route a switch event into the owning session's queue. Unknown
    /// sessions are dropped and logged, per the routing contract.
    pub async fn dispatch(&self, session_id: &str, event: SessionEvent) {
        let handle = self.get(session_id);
        let Some(handle) = handle else {
            debug!(session_id, ?event, "event for unknown session dropped");
            return;
        };
        if matches!(event, SessionEvent::Hangup { .. }) {
            handle.hangup_seen.store(true, Ordering::SeqCst);
        }
        handle.send(event).await;
    }

    /// Flip the degraded flag on every session bound to an instance.
    /// Called by the connection manager around outages; sessions survive
    /// the outage and resume when the link returns.
    pub fn set_instance_degraded(&self, instance_id: &str, degraded: bool) {
        let sessions = self.sessions.read();
        let mut affected = 0usize;
        for handle in sessions.values() {
            if handle.instance_id == instance_id {
                handle.degraded.store(degraded, Ordering::Release);
                affected += 1;
            }
        }
        if affected > 0 {
            debug!(instance_id, degraded, affected, "session degraded flags updated");
        }
    }
}
