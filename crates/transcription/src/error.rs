use murmur_audio::WaveError;
use thiserror::Error;

/// Errors surfaced by a transcription session.
///
/// Nothing here is retried internally; every variant propagates to the
/// immediate caller.
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error(transparent)]
    Wave(#[from] WaveError),

    /// The model loader could not produce a native context. Fatal to
    /// session construction.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The native inference call reported a failure.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The background inference task terminated abnormally.
    #[error("inference task failed: {0}")]
    Task(String),

    /// Processing stopped because cancellation was requested. Segments
    /// already yielded remain valid.
    #[error("processing was cancelled")]
    Cancelled,

    /// Synchronous dispose attempted while a process call holds the
    /// session. Use `dispose_async` instead.
    #[error("cannot dispose while processing, use dispose_async")]
    DisposeInProgress,

    /// The session was already disposed.
    #[error("session has been disposed")]
    Disposed,
}
