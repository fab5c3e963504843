//! AI backend clients: streaming recognition, reasoning, synthesis.
//!
//! Sessions depend on the traits only; the concrete clients live behind
//! them so tests can script backend behavior.

pub mod reasoning;
pub mod recognition;
pub mod synthesis;

pub use reasoning::{ChatTurn, OpenAiReasoning, ReasoningClient};
pub use recognition::{FunAsrRecognition, RecognitionClient, RecognitionStream, TranscriptFragment};
pub use synthesis::{AudioRef, HttpSynthesis, SynthesisClient};

/// Which backend produced an error; drives per-kind retry accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Recognition,
    Reasoning,
    Synthesis,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recognition => write!(f, "recognition"),
            Self::Reasoning => write!(f, "reasoning"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Error surfaced by any backend call. Recovered inside the session via
/// fallback responses up to the per-turn budget, never propagated to the
/// control plane.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend timed out: {0}")]
    Timeout(String),
    #[error("backend failed: {0}")]
    Failed(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}
