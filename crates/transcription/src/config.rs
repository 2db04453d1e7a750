use serde::{Deserialize, Serialize};

/// Token sampling strategy for the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplingStrategy {
    Greedy {
        best_of: Option<i32>,
    },
    BeamSearch {
        beam_size: Option<i32>,
        patience: Option<f32>,
    },
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        SamplingStrategy::Greedy { best_of: None }
    }
}

/// Tuning values for a transcription session.
///
/// Every `Option` field left unset means "use the engine default". A
/// session snapshots its configuration at the start of each call;
/// changing the language between calls goes through
/// [`TranscriptionSession::change_language`](crate::TranscriptionSession::change_language).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Number of compute threads.
    pub threads: Option<i32>,
    /// Maximum text tokens carried over from the previous window.
    pub max_last_text_tokens: Option<i32>,
    /// Encoder audio context size override.
    pub audio_context_size: Option<i32>,
    /// Start offset into the audio, in milliseconds.
    pub offset_ms: Option<i32>,
    /// Amount of audio to process, in milliseconds.
    pub duration_ms: Option<i32>,
    /// Translate the output to English instead of transcribing.
    pub translate: Option<bool>,
    /// Do not carry decoder context across windows.
    pub no_context: Option<bool>,
    /// Force the whole input into a single segment.
    pub single_segment: Option<bool>,
    /// Suppress blank outputs at the start of a sampling window.
    pub suppress_blank: Option<bool>,
    /// Maximum characters per segment.
    pub max_segment_length: Option<i32>,
    /// Split segments on word rather than token boundaries.
    pub split_on_word: Option<bool>,
    /// Maximum tokens per segment.
    pub max_tokens_per_segment: Option<i32>,
    /// Compute per-token timestamps.
    pub token_timestamps: Option<bool>,
    /// Token timestamp probability threshold.
    pub token_timestamps_threshold: Option<f32>,
    /// Token timestamp sum-of-probabilities threshold.
    pub token_timestamps_sum_threshold: Option<f32>,
    /// Initial decoding temperature.
    pub temperature: Option<f32>,
    /// Temperature increment on fallback.
    pub temperature_inc: Option<f32>,
    /// Maximum initial timestamp, as a fraction of the window.
    pub max_initial_ts: Option<f32>,
    /// Beam length penalty.
    pub length_penalty: Option<f32>,
    /// Entropy threshold for fallback.
    pub entropy_threshold: Option<f32>,
    /// Log-probability threshold for fallback.
    pub log_prob_threshold: Option<f32>,
    /// No-speech probability threshold.
    pub no_speech_threshold: Option<f32>,
    /// Text prompt fed to the decoder before the first window.
    pub initial_prompt: Option<String>,
    /// Spoken language (ISO 639-1, e.g. "en"). None = auto-detect.
    pub language: Option<String>,
    #[serde(default)]
    pub sampling_strategy: SamplingStrategy,
    /// Aggregate per-token probabilities into each segment.
    #[serde(default)]
    pub compute_probabilities: bool,
    /// Mark speaker turns (tinydiarize models).
    #[serde(default)]
    pub diarize: bool,
}
