//! Seam to the native speech-recognition engine.
//!
//! The engine is an external capability: given mono f32 PCM at 16 kHz and a
//! parameter block it produces ordered segments, reported through callbacks
//! on the thread running the inference call. Implementations route those
//! callbacks through [`crate::registry`] using the session id they were
//! handed, never through closures capturing session state, since the real
//! backend crosses a C ABI where only an integer token survives.

#[cfg(feature = "whisper-cpp")]
pub mod whisper_cpp;

use std::any::Any;
use std::sync::Arc;

use crate::config::TranscriptionConfig;
use crate::error::TranscriptionError;

/// Identifies a session in the process-wide callback registry.
pub type SessionId = u64;

/// Read access to the one-shot native state of an inference call.
///
/// Segment times are native ticks of 10 ms each.
pub trait EngineState: Send {
    fn segment_count(&self) -> usize;
    fn segment_start(&self, index: usize) -> i64;
    fn segment_end(&self, index: usize) -> i64;
    fn segment_text(&self, index: usize) -> String;
    fn token_count(&self, index: usize) -> usize;
    fn token_probability(&self, index: usize, token: usize) -> f32;
    fn speaker_turn(&self, index: usize) -> bool;
    /// Language id the engine currently reports for this call, if any.
    fn detected_language(&self) -> Option<String>;

    /// Concrete-type access for the backend that created this state.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A loaded model plus derived runtime state. Exactly one session owns a
/// context; the context is freed when the last owner drops it.
pub trait EngineContext: Send + Sync + 'static {
    /// Creates a fresh per-call state. The state must never outlive the
    /// call it was created for; dropping it releases the native resources.
    fn create_state(&self) -> Result<Box<dyn EngineState>, TranscriptionError>;

    /// Runs one blocking inference call over `samples`.
    ///
    /// The implementation must dispatch `on_encoder_begin`, `on_progress`
    /// and `on_new_segment` through [`crate::registry`] with `session`,
    /// synchronously on the calling thread, and honor an encoder-begin
    /// veto by stopping early.
    fn run_inference(
        &self,
        state: &mut dyn EngineState,
        config: &TranscriptionConfig,
        samples: &[f32],
        session: SessionId,
    ) -> Result<(), TranscriptionError>;

    /// Estimates the spoken language of `samples` without running a full
    /// decode. `fast` selects a lower-fidelity spectral conversion where
    /// the engine offers one. Returns `None` when detection has no answer.
    fn detect_language(
        &self,
        state: &mut dyn EngineState,
        samples: &[f32],
        config: &TranscriptionConfig,
        fast: bool,
    ) -> Result<Option<(String, f32)>, TranscriptionError>;
}

/// Produces an engine context from a model source (file path, byte buffer).
/// Model acquisition and cataloguing live outside this crate.
pub trait ModelLoader {
    fn load(&self) -> Result<Arc<dyn EngineContext>, TranscriptionError>;
}
