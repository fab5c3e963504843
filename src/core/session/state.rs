//! Call session states and the reasons a call ends.

use serde::{Deserialize, Serialize};

/// The finite state set of a call session. Every session is in exactly
/// one of these at all times; `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Leg exists but has not been answered/processed yet.
    Idle,
    TtsPlaying,
    AsrListening,
    LlmProcessing,
    /// Brief interval after synthesis ends and before the next
    /// recognition result begins.
    WaitingUser,
    /// Transient: a backend failure is being handled.
    Error,
    Ended,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::TtsPlaying => "tts_playing",
            CallState::AsrListening => "asr_listening",
            CallState::LlmProcessing => "llm_processing",
            CallState::WaitingUser => "waiting_user",
            CallState::Error => "error",
            CallState::Ended => "ended",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended; decides the recorded call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The switch reported the leg hung up.
    Hangup,
    InactivityTimeout,
    MaxTurnsReached,
    /// Backend failures exceeded the per-turn limit.
    BackendExhausted,
    /// Irrecoverable internal inconsistency.
    Fatal,
}

impl EndReason {
    /// Status written to the call record. Only fatal inconsistencies mark
    /// the record failed; graceful endings record as ended.
    pub fn record_status(&self) -> &'static str {
        match self {
            EndReason::Fatal => "failed",
            _ => "ended",
        }
    }
}
