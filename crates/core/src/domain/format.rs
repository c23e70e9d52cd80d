//! PCM stream formats
//!
//! Every stream in the pipeline is interleaved stereo PCM. A format is fully
//! described by its sample rate, bit depth and channel count; the sample
//! encoding only matters at 32 bits, where both integer and float exist.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Channel count used throughout the pipeline
pub const CHANNEL_COUNT: u16 = 2;

/// How samples are represented inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleEncoding {
    /// Signed little-endian integer PCM
    #[default]
    Int,
    /// IEEE 754 little-endian float, only valid at 32 bits
    Float,
}

/// Interleaved PCM format
///
/// Two formats compare equal iff sample rate, bit depth and channel count all
/// match exactly. Use [`PcmFormat::is_identical`] when the encoding must match
/// as well.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    #[serde(default)]
    pub encoding: SampleEncoding,
}

impl PcmFormat {
    /// Stereo integer PCM
    pub fn int(sample_rate: u32, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            bits_per_sample,
            channels: CHANNEL_COUNT,
            encoding: SampleEncoding::Int,
        }
    }

    /// Stereo 32-bit float PCM
    pub fn float32(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bits_per_sample: 32,
            channels: CHANNEL_COUNT,
            encoding: SampleEncoding::Float,
        }
    }

    /// Stereo format at the given rate and depth, keeping `like`'s encoding
    /// when both are 32-bit so float sources are not reinterpreted as integers.
    pub fn matching_encoding(sample_rate: u32, bits_per_sample: u16, like: &PcmFormat) -> Self {
        if bits_per_sample == 32 && like.bits_per_sample == 32 {
            Self {
                encoding: like.encoding,
                ..Self::int(sample_rate, 32)
            }
        } else {
            Self::int(sample_rate, bits_per_sample)
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Bytes per frame
    pub fn block_align(&self) -> usize {
        usize::from(self.channels) * self.bytes_per_sample()
    }

    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * self.block_align() as u64
    }

    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.block_align()
    }

    /// Whole frames contained in `bytes`; a trailing partial frame is ignored
    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        match self.block_align() {
            0 => 0,
            align => bytes / align,
        }
    }

    /// Frames spanning `duration`, rounded down
    pub fn frames_for(&self, duration: Duration) -> usize {
        (u128::from(self.sample_rate) * duration.as_micros() / 1_000_000) as usize
    }

    /// Equality including the sample encoding
    pub fn is_identical(&self, other: &PcmFormat) -> bool {
        self == other && self.encoding == other.encoding
    }

    /// Whether this format can be carried by the PCM codec
    pub fn is_supported(&self) -> bool {
        self.sample_rate > 0
            && self.channels > 0
            && match self.encoding {
                SampleEncoding::Int => matches!(self.bits_per_sample, 16 | 24 | 32),
                SampleEncoding::Float => self.bits_per_sample == 32,
            }
    }
}

impl PartialEq for PcmFormat {
    fn eq(&self, other: &Self) -> bool {
        self.sample_rate == other.sample_rate
            && self.bits_per_sample == other.bits_per_sample
            && self.channels == other.channels
    }
}

impl Eq for PcmFormat {}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoding = match self.encoding {
            SampleEncoding::Int => "int",
            SampleEncoding::Float => "float",
        };
        write!(
            f,
            "{} Hz/{}-bit {}/{}ch",
            self.sample_rate, self.bits_per_sample, encoding, self.channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_align_and_rate() {
        let format = PcmFormat::int(48000, 24);
        assert_eq!(format.block_align(), 6);
        assert_eq!(format.bytes_per_second(), 288_000);
        assert_eq!(format.frames_to_bytes(10), 60);
        assert_eq!(format.bytes_to_frames(61), 10);
    }

    #[test]
    fn test_equality_ignores_encoding() {
        let int = PcmFormat::int(48000, 32);
        let float = PcmFormat::float32(48000);
        assert_eq!(int, float);
        assert!(!int.is_identical(&float));
        assert_ne!(PcmFormat::int(48000, 16), PcmFormat::int(48000, 24));
        assert_ne!(PcmFormat::int(44100, 16), PcmFormat::int(48000, 16));
    }

    #[test]
    fn test_matching_encoding_keeps_float_at_32_bits() {
        let source = PcmFormat::float32(48000);
        assert_eq!(
            PcmFormat::matching_encoding(96000, 32, &source).encoding,
            SampleEncoding::Float
        );
        assert_eq!(
            PcmFormat::matching_encoding(96000, 24, &source).encoding,
            SampleEncoding::Int
        );
    }

    #[test]
    fn test_frames_for_duration() {
        let format = PcmFormat::int(48000, 16);
        assert_eq!(format.frames_for(Duration::from_millis(10)), 480);
        assert_eq!(format.frames_for(Duration::from_micros(20_833)), 999);
    }

    #[test]
    fn test_supported_formats() {
        assert!(PcmFormat::int(44100, 16).is_supported());
        assert!(PcmFormat::float32(44100).is_supported());
        assert!(!PcmFormat::int(44100, 8).is_supported());
        assert!(!PcmFormat::int(0, 16).is_supported());
        let bad_float = PcmFormat {
            encoding: SampleEncoding::Float,
            ..PcmFormat::int(48000, 16)
        };
        assert!(!bad_float.is_supported());
    }

    #[test]
    fn test_display() {
        assert_eq!(PcmFormat::int(48000, 16).to_string(), "48000 Hz/16-bit int/2ch");
        assert_eq!(PcmFormat::float32(44100).to_string(), "44100 Hz/32-bit float/2ch");
    }
}
