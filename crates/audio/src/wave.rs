//! Incremental RIFF/WAVE decoding to normalized f32 samples.
//!
//! [`WaveReader`] (blocking) and [`AsyncWaveReader`] (suspending at stream
//! reads) share the same parsing and demultiplexing helpers, so the two
//! paths decode identically. Chunks other than `fmt ` and `data` are
//! consumed and discarded, which keeps a single code path for seekable and
//! non-seekable streams alike.

use std::io::Read;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::WaveError;

/// Read granularity for the data region, in bytes per channel.
const READ_CHUNK: usize = 2048;

/// Shape of the PCM payload, located once during initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Size of the `data` chunk payload in bytes.
    pub data_size: u32,
    /// Byte offset of the `data` payload from the start of the stream.
    pub data_offset: u64,
}

impl WaveFormat {
    /// Number of samples each channel contributes.
    pub fn samples_per_channel(&self) -> u64 {
        self.data_size as u64 / (self.bits_per_sample as u64 / 8) / self.channels as u64
    }

    /// Bytes occupied by one interleaved frame.
    pub fn frame_size(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }

    /// Divisor that maps raw integer samples into roughly [-1, 1].
    pub fn full_scale(&self) -> f32 {
        match self.bits_per_sample {
            8 => 128.0,
            16 => 32768.0,
            24 => 8388608.0,
            _ => 2147483648.0,
        }
    }
}

fn check_riff_header(header: &[u8; 12]) -> Result<(), WaveError> {
    if &header[0..4] != b"RIFF" {
        return Err(WaveError::Corrupted("invalid RIFF header".into()));
    }
    // Bytes 4..8 carry the file size; it is not needed for decoding.
    if &header[8..12] != b"WAVE" {
        return Err(WaveError::Corrupted("invalid WAVE header".into()));
    }
    Ok(())
}

/// Splits an 8-byte chunk header into its tag and payload size.
fn parse_chunk_header(header: &[u8; 8]) -> Result<([u8; 4], u32), WaveError> {
    let size = i32::from_le_bytes(header[4..8].try_into().unwrap());
    if size < 0 {
        return Err(WaveError::Corrupted("negative chunk size".into()));
    }
    Ok(([header[0], header[1], header[2], header[3]], size as u32))
}

/// Extracts `(channels, sample_rate, bits_per_sample)` from a `fmt ` payload
/// of at least 16 bytes, rejecting non-PCM encodings.
fn parse_fmt_payload(payload: &[u8]) -> Result<(u16, u32, u16), WaveError> {
    let format_tag = u16::from_le_bytes(payload[0..2].try_into().unwrap());
    // PCM or WAVE_FORMAT_EXTENSIBLE carrying PCM.
    if format_tag != 1 && format_tag != 0xFFFE {
        return Err(WaveError::Unsupported(format!(
            "audio format tag {format_tag} is not PCM"
        )));
    }
    let channels = u16::from_le_bytes(payload[2..4].try_into().unwrap());
    let sample_rate = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let bits_per_sample = u16::from_le_bytes(payload[14..16].try_into().unwrap());
    if channels == 0 {
        return Err(WaveError::Corrupted("zero channels".into()));
    }
    if !matches!(bits_per_sample, 8 | 16 | 24 | 32) {
        return Err(WaveError::Unsupported(format!(
            "{bits_per_sample} bits per sample"
        )));
    }
    Ok((channels, sample_rate, bits_per_sample))
}

/// Demultiplexes one interleaved frame into raw per-channel integer values.
fn decode_frame(frame: &[u8], bits_per_sample: u16, values: &mut [i64]) {
    let width = bits_per_sample as usize / 8;
    for (channel, value) in values.iter_mut().enumerate() {
        let at = channel * width;
        *value = match bits_per_sample {
            8 => frame[at] as i64 - 128,
            16 => i16::from_le_bytes([frame[at], frame[at + 1]]) as i64,
            // Sign-extend the 24-bit sample through the top of an i32.
            24 => (i32::from_le_bytes([0, frame[at], frame[at + 1], frame[at + 2]]) >> 8) as i64,
            _ => i32::from_le_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
                as i64,
        };
    }
}

/// Per-frame fold from raw channel values to one output sample.
enum FrameFold {
    Channel(usize),
    Average,
}

impl FrameFold {
    fn apply(&self, values: &[i64], full_scale: f32) -> f32 {
        match self {
            FrameFold::Channel(index) => values[*index] as f32 / full_scale,
            FrameFold::Average => {
                let sum: i64 = values.iter().sum();
                (sum as f32 / full_scale) / values.len() as f32
            }
        }
    }
}

/// Incrementally folds raw data-region bytes into output samples, tracking
/// how many frames are still owed. Shared by the sync and async readers.
struct FrameAccumulator {
    format: WaveFormat,
    fold: FrameFold,
    values: Vec<i64>,
    out: Vec<f32>,
    total: usize,
}

impl FrameAccumulator {
    fn new(format: WaveFormat, fold: FrameFold) -> Self {
        let total = format.samples_per_channel() as usize;
        Self {
            fold,
            values: vec![0i64; format.channels as usize],
            out: Vec::with_capacity(total),
            total,
            format,
        }
    }

    fn remaining_bytes(&self) -> usize {
        (self.total - self.out.len()) * self.format.frame_size()
    }

    fn is_done(&self) -> bool {
        self.out.len() >= self.total
    }

    /// Consumes complete frames from `bytes`; a trailing partial frame is
    /// left unconsumed and surfaces as a short sample count in `finish`.
    fn push(&mut self, bytes: &[u8]) {
        let frame_size = self.format.frame_size();
        for frame in bytes.chunks_exact(frame_size) {
            decode_frame(frame, self.format.bits_per_sample, &mut self.values);
            self.out
                .push(self.fold.apply(&self.values, self.format.full_scale()));
        }
    }

    fn finish(self) -> Result<Vec<f32>, WaveError> {
        if self.out.len() < self.total {
            return Err(WaveError::Corrupted(format!(
                "data chunk ended after {} of {} samples",
                self.out.len(),
                self.total
            )));
        }
        Ok(self.out)
    }
}

/// Blocking WAV decoder over any [`Read`] stream.
pub struct WaveReader<R> {
    reader: R,
    format: Option<WaveFormat>,
}

impl<R: Read> WaveReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            format: None,
        }
    }

    /// Reads up to `buf.len()` bytes, looping until the buffer is full or
    /// the stream ends. Returns the number of bytes actually read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, WaveError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn read_exact_or_corrupt(&mut self, buf: &mut [u8], what: &str) -> Result<(), WaveError> {
        if self.fill(buf)? != buf.len() {
            return Err(WaveError::Corrupted(format!("cannot read {what}")));
        }
        Ok(())
    }

    /// Locates the `fmt ` and `data` chunks. Idempotent: the format is
    /// constructed once and later calls return the cached copy.
    pub fn initialize(&mut self) -> Result<WaveFormat, WaveError> {
        if let Some(format) = self.format {
            return Ok(format);
        }

        let mut header = [0u8; 12];
        self.read_exact_or_corrupt(&mut header, "riff header")?;
        check_riff_header(&header)?;
        let mut position = 12u64;

        // Scan for the fmt chunk, discarding everything before it.
        let fmt_size = loop {
            let mut chunk = [0u8; 8];
            self.read_exact_or_corrupt(&mut chunk, "next chunk")?;
            position += 8;
            let (tag, size) = parse_chunk_header(&chunk)?;
            if &tag == b"fmt " {
                break size as usize;
            }
            let mut rest = vec![0u8; size as usize];
            self.read_exact_or_corrupt(&mut rest, "chunk body")?;
            position += size as u64;
        };

        if fmt_size < 16 {
            return Err(WaveError::Corrupted("fmt chunk too small".into()));
        }
        let mut fmt = vec![0u8; fmt_size];
        self.read_exact_or_corrupt(&mut fmt, "format chunk")?;
        position += fmt_size as u64;
        let (channels, sample_rate, bits_per_sample) = parse_fmt_payload(&fmt)?;

        // Scan for the data chunk; its payload is recorded, not consumed.
        let (data_size, data_offset) = loop {
            let mut chunk = [0u8; 8];
            self.read_exact_or_corrupt(&mut chunk, "next chunk")?;
            position += 8;
            let (tag, size) = parse_chunk_header(&chunk)?;
            if &tag == b"data" {
                break (size, position);
            }
            let mut rest = vec![0u8; size as usize];
            self.read_exact_or_corrupt(&mut rest, "chunk body")?;
            position += size as u64;
        };

        let format = WaveFormat {
            channels,
            sample_rate,
            bits_per_sample,
            data_size,
            data_offset,
        };
        debug!(?format, "wave stream initialized");
        self.format = Some(format);
        Ok(format)
    }

    /// Decodes the samples of one channel, normalized to roughly [-1, 1].
    pub fn channel_samples(mut self, channel: u16) -> Result<Vec<f32>, WaveError> {
        let format = self.initialize()?;
        if channel >= format.channels {
            return Err(WaveError::ChannelOutOfRange(channel));
        }
        self.collect(FrameAccumulator::new(
            format,
            FrameFold::Channel(channel as usize),
        ))
    }

    /// Decodes a mono downmix: the per-frame arithmetic mean of all channels.
    pub fn average_samples(mut self) -> Result<Vec<f32>, WaveError> {
        let format = self.initialize()?;
        self.collect(FrameAccumulator::new(format, FrameFold::Average))
    }

    fn collect(&mut self, mut acc: FrameAccumulator) -> Result<Vec<f32>, WaveError> {
        let mut buf = vec![0u8; READ_CHUNK * acc.format.channels as usize];
        while !acc.is_done() {
            let want = buf.len().min(acc.remaining_bytes());
            let got = self.fill(&mut buf[..want])?;
            if got == 0 {
                break;
            }
            acc.push(&buf[..got]);
            if got < want {
                break;
            }
        }
        acc.finish()
    }
}

/// Suspending WAV decoder over any [`AsyncRead`] stream.
///
/// Behaviorally identical to [`WaveReader`]; the only difference is where
/// execution may yield.
pub struct AsyncWaveReader<R> {
    reader: R,
    format: Option<WaveFormat>,
}

impl<R: AsyncRead + Unpin> AsyncWaveReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            format: None,
        }
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize, WaveError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn read_exact_or_corrupt(
        &mut self,
        buf: &mut [u8],
        what: &str,
    ) -> Result<(), WaveError> {
        if self.fill(buf).await? != buf.len() {
            return Err(WaveError::Corrupted(format!("cannot read {what}")));
        }
        Ok(())
    }

    /// Locates the `fmt ` and `data` chunks. Idempotent.
    pub async fn initialize(&mut self) -> Result<WaveFormat, WaveError> {
        if let Some(format) = self.format {
            return Ok(format);
        }

        let mut header = [0u8; 12];
        self.read_exact_or_corrupt(&mut header, "riff header").await?;
        check_riff_header(&header)?;
        let mut position = 12u64;

        let fmt_size = loop {
            let mut chunk = [0u8; 8];
            self.read_exact_or_corrupt(&mut chunk, "next chunk").await?;
            position += 8;
            let (tag, size) = parse_chunk_header(&chunk)?;
            if &tag == b"fmt " {
                break size as usize;
            }
            let mut rest = vec![0u8; size as usize];
            self.read_exact_or_corrupt(&mut rest, "chunk body").await?;
            position += size as u64;
        };

        if fmt_size < 16 {
            return Err(WaveError::Corrupted("fmt chunk too small".into()));
        }
        let mut fmt = vec![0u8; fmt_size];
        self.read_exact_or_corrupt(&mut fmt, "format chunk").await?;
        position += fmt_size as u64;
        let (channels, sample_rate, bits_per_sample) = parse_fmt_payload(&fmt)?;

        let (data_size, data_offset) = loop {
            let mut chunk = [0u8; 8];
            self.read_exact_or_corrupt(&mut chunk, "next chunk").await?;
            position += 8;
            let (tag, size) = parse_chunk_header(&chunk)?;
            if &tag == b"data" {
                break (size, position);
            }
            let mut rest = vec![0u8; size as usize];
            self.read_exact_or_corrupt(&mut rest, "chunk body").await?;
            position += size as u64;
        };

        let format = WaveFormat {
            channels,
            sample_rate,
            bits_per_sample,
            data_size,
            data_offset,
        };
        debug!(?format, "wave stream initialized");
        self.format = Some(format);
        Ok(format)
    }

    /// Decodes the samples of one channel, normalized to roughly [-1, 1].
    pub async fn channel_samples(mut self, channel: u16) -> Result<Vec<f32>, WaveError> {
        let format = self.initialize().await?;
        if channel >= format.channels {
            return Err(WaveError::ChannelOutOfRange(channel));
        }
        self.collect(FrameAccumulator::new(
            format,
            FrameFold::Channel(channel as usize),
        ))
        .await
    }

    /// Decodes a mono downmix: the per-frame arithmetic mean of all channels.
    pub async fn average_samples(mut self) -> Result<Vec<f32>, WaveError> {
        let format = self.initialize().await?;
        self.collect(FrameAccumulator::new(format, FrameFold::Average))
            .await
    }

    async fn collect(&mut self, mut acc: FrameAccumulator) -> Result<Vec<f32>, WaveError> {
        let mut buf = vec![0u8; READ_CHUNK * acc.format.channels as usize];
        while !acc.is_done() {
            let want = buf.len().min(acc.remaining_bytes());
            let got = self.fill(&mut buf[..want]).await?;
            if got == 0 {
                break;
            }
            acc.push(&buf[..got]);
            if got < want {
                break;
            }
        }
        acc.finish()
    }
}
