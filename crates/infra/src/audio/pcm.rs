//! Interleaved PCM codec and pull sources
//!
//! Samples travel between stages as little-endian bytes in the stream's own
//! format. Conversion stages decode to normalised `f32` and encode back.

use super::fanout::FanoutBuffer;
use audiomirror_core::{ChannelId, PcmFormat, SampleEncoding};
use std::sync::Arc;

const I16_SCALE: f32 = 32_768.0;
const I24_SCALE: f32 = 8_388_608.0;
const I32_SCALE: f64 = 2_147_483_648.0;

/// Sample layout of a supported PCM format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLayout {
    I16,
    I24,
    I32,
    F32,
}

impl SampleLayout {
    /// `None` for formats the codec cannot carry
    pub fn of(format: &PcmFormat) -> Option<Self> {
        match (format.encoding, format.bits_per_sample) {
            (SampleEncoding::Int, 16) => Some(Self::I16),
            (SampleEncoding::Int, 24) => Some(Self::I24),
            (SampleEncoding::Int, 32) => Some(Self::I32),
            (SampleEncoding::Float, 32) => Some(Self::F32),
            _ => None,
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            Self::I16 => 2,
            Self::I24 => 3,
            Self::I32 | Self::F32 => 4,
        }
    }

    /// Append the decoded samples of `bytes` to `out`
    ///
    /// A trailing partial sample is ignored.
    pub fn decode(&self, bytes: &[u8], out: &mut Vec<f32>) {
        let chunks = bytes.chunks_exact(self.bytes());
        out.reserve(chunks.len());

        match self {
            Self::I16 => out.extend(chunks.map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / I16_SCALE)),
            Self::I24 => out.extend(chunks.map(|b| {
                // Sign-extend by placing the sample in the top three bytes
                let value = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                value as f32 / I24_SCALE
            })),
            Self::I32 => out.extend(chunks.map(|b| {
                let value = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                (f64::from(value) / I32_SCALE) as f32
            })),
            Self::F32 => out.extend(chunks.map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))),
        }
    }

    /// Append `samples` to `out`, clamping integer formats to full scale
    pub fn encode(&self, samples: &[f32], out: &mut Vec<u8>) {
        out.reserve(samples.len() * self.bytes());

        for &sample in samples {
            match self {
                Self::I16 => {
                    let value = (sample * I16_SCALE).round().clamp(-I16_SCALE, I16_SCALE - 1.0) as i16;
                    out.extend_from_slice(&value.to_le_bytes());
                }
                Self::I24 => {
                    let value = (sample * I24_SCALE).round().clamp(-I24_SCALE, I24_SCALE - 1.0) as i32;
                    out.extend_from_slice(&value.to_le_bytes()[..3]);
                }
                Self::I32 => {
                    let value =
                        (f64::from(sample) * I32_SCALE).round().clamp(-I32_SCALE, I32_SCALE - 1.0) as i32;
                    out.extend_from_slice(&value.to_le_bytes());
                }
                Self::F32 => out.extend_from_slice(&sample.to_le_bytes()),
            }
        }
    }
}

/// Pull interface between pipeline stages
///
/// `read` never blocks and always writes whole frames of [`format`](Self::format);
/// it returns the number of bytes written, 0 when starved.
pub trait PcmSource: Send {
    fn format(&self) -> PcmFormat;

    fn read(&mut self, dst: &mut [u8]) -> usize;
}

/// One channel's fan-out queue as a [`PcmSource`]
pub struct QueueSource {
    fanout: Arc<FanoutBuffer>,
    channel: ChannelId,
    format: PcmFormat,
}

impl QueueSource {
    pub fn new(fanout: Arc<FanoutBuffer>, channel: ChannelId, format: PcmFormat) -> Self {
        Self {
            fanout,
            channel,
            format,
        }
    }
}

impl PcmSource for QueueSource {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn read(&mut self, dst: &mut [u8]) -> usize {
        let whole = dst.len() - dst.len() % self.format.block_align().max(1);
        self.fanout.pull(self.channel, &mut dst[..whole])
    }
}
