//! Real-time audio: per-call pipeline and resampling.

pub mod pipeline;
pub mod resample;

pub use pipeline::{AudioPipeline, PipelineConfig};
