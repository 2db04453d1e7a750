pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod registry;
pub mod session;

pub use config::{SamplingStrategy, TranscriptionConfig};
pub use error::TranscriptionError;
pub use session::TranscriptionSession;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A contiguous recognized span, emitted once in engine discovery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Recognized text; never empty when emitted.
    pub text: String,
    /// Offset of the span from the start of the audio.
    pub start: Duration,
    /// End of the span; always `>= start`.
    pub end: Duration,
    /// Lowest per-token probability, in [0, 1]. Zero unless
    /// probability computation was requested.
    pub min_probability: f32,
    /// Highest per-token probability, in [0, 1]. Zero unless
    /// probability computation was requested.
    pub max_probability: f32,
    /// Mean per-token probability, in [0, 1]. Zero unless
    /// probability computation was requested.
    pub probability: f32,
    /// Language the engine reported while this segment was produced.
    pub language: Option<String>,
    /// Whether the engine flagged a speaker change after this segment.
    pub speaker_turn: bool,
}
