use thiserror::Error;

/// Errors raised while decoding a RIFF/WAVE container.
///
/// Decode errors are always fatal to the operation that raised them;
/// nothing in this crate retries.
#[derive(Debug, Error)]
pub enum WaveError {
    /// The container is structurally invalid: bad magic, short read,
    /// negative chunk size, undersized `fmt ` chunk, or fewer audio
    /// frames than the `data` chunk declared.
    #[error("corrupted wave file: {0}")]
    Corrupted(String),

    /// The container is valid but carries a non-PCM encoding.
    #[error("unsupported wave format: {0}")]
    Unsupported(String),

    /// A channel index past the end of the interleaved frame.
    #[error("channel index {0} out of range")]
    ChannelOutOfRange(u16),

    #[error("wave stream read failed: {0}")]
    Io(#[from] std::io::Error),
}
