//! Ordered per-call transcript log.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::backends::ChatTurn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub turn: u32,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only conversation log, flushed to the stores when the session
/// ends.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: u32, speaker: Speaker, text: impl Into<String>) {
        self.entries.push(TranscriptEntry {
            turn,
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Conversation context for the reasoning backend, in arrival order.
    pub fn as_chat_turns(&self) -> Vec<ChatTurn> {
        self.entries
            .iter()
            .map(|entry| match entry.speaker {
                Speaker::User => ChatTurn::user(entry.text.clone()),
                Speaker::Assistant => ChatTurn::assistant(entry.text.clone()),
            })
            .collect()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.entries).unwrap_or_else(|_| "[]".to_string())
    }
}
