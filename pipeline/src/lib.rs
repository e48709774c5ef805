//! Server-side orchestration for the incremental speech-to-speech pipeline:
//! the stability-based commit tracker, the ASR→MT→TTS staged dispatch, and
//! the backpressure controller that regulates it under load.

pub mod adapters;
pub mod backpressure;
pub mod commit;
pub mod orchestrator;
pub mod stats;

pub use adapters::{AsrAdapter, MtAdapter, TtsAdapter};
pub use backpressure::{BackpressureController, BackpressureState};
pub use commit::CommitTracker;
pub use orchestrator::{Orchestrator, OrchestratorHandle, PipelineEvent};
pub use stats::SegmentStats;

/// Errors raised by the pipeline's own stages. Protocol errors (malformed
/// frames, missing config) are handled at the endpoint boundary in
/// `server` and are not part of this enum.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("ASR adapter error: {0}")]
    Asr(String),
    #[error("MT adapter error: {0}")]
    Mt(String),
    #[error("TTS adapter error: {0}")]
    Tts(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}
