//! Persistence clients. Engines are external; these are thin consumers
//! of the given schemas.

pub mod db;
pub mod session_store;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::core::session::{CallRecordSink, CallReport};

pub use db::{Db, DbError};
pub use session_store::SessionStore;

/// Record sink over whichever stores are configured. Either side may be
/// absent; persistence failures are logged and never fail a call.
pub struct PersistentRecordSink {
    pub db: Option<Arc<Db>>,
    pub sessions: Option<Arc<SessionStore>>,
}

#[async_trait]
impl CallRecordSink for PersistentRecordSink {
    async fn record_call(&self, report: &CallReport) {
        if let Some(db) = &self.db {
            if let Err(e) = db.insert_call_record(report).await {
                warn!(session_id = %report.session_id, error = %e, "call record insert failed");
            }
        }
        if let Some(sessions) = &self.sessions {
            sessions.flush_report(report).await;
        }
    }
}
