pub mod error;
pub mod wave;

pub use error::WaveError;
pub use wave::{AsyncWaveReader, WaveFormat, WaveReader};
