//! Events consumed by a session's single-writer loop.
//!
//! Producers are the event-socket router, the audio pipeline and the
//! spawned backend tasks; the session's consumer task is the only place
//! state transitions happen.

use crate::core::backends::{AudioRef, BackendError};

/// Why a synthesized utterance was produced; decides the transition taken
/// when it finishes playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakPurpose {
    Welcome,
    Reply,
    Fallback,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// The switch answered the leg.
    Answered,
    /// A recognition fragment from the audio pipeline.
    Transcript { text: String, is_final: bool },
    /// Start-of-speech detected while synthesis was playing (barge-in).
    SpeechStarted,
    /// The switch finished (or aborted) playback of `audio_ref`.
    PlaybackFinished { audio_ref: String },
    /// A spawned reasoning task finished. `turn_gen` stamps the turn the
    /// call belonged to; stale results are discarded.
    ReasoningDone {
        turn_gen: u64,
        result: Result<String, BackendError>,
    },
    /// A spawned synthesis task finished.
    SpeakReady {
        turn_gen: u64,
        purpose: SpeakPurpose,
        text: String,
        result: Result<AudioRef, BackendError>,
    },
    /// The recognition stream failed past its reconnect budget.
    RecognitionFailed { error: BackendError },
    /// The switch reported the leg hung up. Always wins over any other
    /// queued event for the same session.
    Hangup { cause: Option<String> },
}
