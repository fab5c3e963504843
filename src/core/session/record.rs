//! Call outcome reporting: what a finished session leaves behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::transcript::TranscriptEntry;

/// Snapshot of a finished call, flushed to the relational call record and
/// the session store.
#[derive(Debug, Clone)]
pub struct CallReport {
    pub session_id: String,
    pub caller_number: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: u64,
    /// "ended" or "failed" per the end reason.
    pub status: String,
    pub transcript: Vec<TranscriptEntry>,
}

/// Result handed to the outbound scheduler when a campaign call finishes.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// answered / no_answer / busy / failed
    pub result: String,
    pub duration_secs: u64,
}

/// Where finished calls are written. Implemented over the relational and
/// session stores; tests collect reports in memory.
#[async_trait]
pub trait CallRecordSink: Send + Sync {
    async fn record_call(&self, report: &CallReport);
}

/// Classify a switch hangup cause into a campaign call result.
pub fn classify_hangup(answered: bool, cause: Option<&str>) -> &'static str {
    if answered {
        return "answered";
    }
    match cause.unwrap_or("") {
        "NO_ANSWER" | "ORIGINATOR_CANCEL" | "NO_USER_RESPONSE" => "no_answer",
        "USER_BUSY" => "busy",
        _ => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_hangup() {
        assert_eq!(classify_hangup(true, Some("NORMAL_CLEARING")), "answered");
        assert_eq!(classify_hangup(false, Some("NO_ANSWER")), "no_answer");
        assert_eq!(classify_hangup(false, Some("USER_BUSY")), "busy");
        assert_eq!(classify_hangup(false, Some("CALL_REJECTED")), "failed");
        assert_eq!(classify_hangup(false, None), "failed");
    }
}
