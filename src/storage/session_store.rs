//! Ephemeral per-call state in the key-value store (redis).
//!
//! Keys are TTL-bound: a crashed bridge leaves no permanent garbage
//! behind. The relational call record is the durable copy; this store
//! holds the live snapshots and final transcripts the control plane
//! polls.

use std::sync::Arc;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

use crate::core::session::{CallReport, SessionSnapshot};

pub struct SessionStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl SessionStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Arc<Self>, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("session store connected");
        Ok(Arc::new(Self { conn, ttl_seconds }))
    }

    fn session_key(session_id: &str, field: &str) -> String {
        format!("session:{session_id}:{field}")
    }

    pub async fn save_snapshot(&self, snapshot: &SessionSnapshot) {
        let Ok(payload) = serde_json::to_string(snapshot) else {
            return;
        };
        let key = Self::session_key(&snapshot.session_id, "state");
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(&key, payload, self.ttl_seconds)
            .await
        {
            warn!(error = %e, "session snapshot write failed");
        }
    }

    pub async fn load_snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let key = Self::session_key(session_id, "state");
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(&key).await.ok()?;
        payload.and_then(|p| serde_json::from_str(&p).ok())
    }

    /// Final transcript flush; kept for the TTL window for the control
    /// plane's post-call queries.
    pub async fn flush_report(&self, report: &CallReport) {
        let Ok(payload) = serde_json::to_string(&report.transcript) else {
            return;
        };
        let key = Self::session_key(&report.session_id, "transcript");
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(&key, payload, self.ttl_seconds)
            .await
        {
            warn!(error = %e, "transcript flush failed");
        }
    }

}
