//! Configuration for the mirror engine
//!
//! This module provides:
//! - Per-channel output settings ([`ChannelConfig`])
//! - Engine-wide capture and conversion settings ([`EngineConfig`])
//! - Validation of both
//!
//! Configuration is plain data. It is persisted by whoever owns the settings
//! store; the engine only consumes the value handed to it and never mutates
//! it while running.

use crate::domain::device::{ChannelId, DeviceId};
use crate::domain::error::{MirrorError, Result, Stage};
use serde::{Deserialize, Serialize};

/// Supported target bit depths
pub const SUPPORTED_BIT_DEPTHS: [u16; 3] = [16, 24, 32];

/// Share-mode preference for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SharePreference {
    /// Follow the channel's exclusivity flag
    #[default]
    Auto,
    Exclusive,
    Shared,
}

/// Render-loop synchronisation preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncPreference {
    /// Event-driven
    #[default]
    Auto,
    Event,
    Polling,
}

/// Buffer duration alignment rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BufferAlignment {
    /// Use the requested duration after generic clamping
    #[default]
    Default,
    /// Never go below a device-safe floor
    Minimum,
}

/// Whether the pipeline may convert audio on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConversionPolicy {
    /// Any format mismatch is reported instead of converted
    #[default]
    Strict,
    /// Insert a resampling stage where a mismatch would otherwise fail
    Flexible,
}

/// Resampler quality ordinal, higher = better and slower
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct ResamplerQuality(u8);

impl ResamplerQuality {
    pub const FASTEST: u8 = 0;
    pub const BEST: u8 = 4;

    /// Out-of-range values are clamped
    pub fn new(level: u8) -> Self {
        Self(level.min(Self::BEST))
    }

    pub fn level(&self) -> u8 {
        self.0
    }
}

impl Default for ResamplerQuality {
    fn default() -> Self {
        Self(3)
    }
}

impl From<u8> for ResamplerQuality {
    fn from(level: u8) -> Self {
        Self::new(level)
    }
}

impl From<ResamplerQuality> for u8 {
    fn from(quality: ResamplerQuality) -> Self {
        quality.0
    }
}

/// Settings for one output channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Render endpoint (None or empty = system default)
    pub device_id: Option<DeviceId>,

    /// Exclusivity flag, consulted when `share_mode` is `Auto`
    pub exclusive: bool,

    /// Ask the platform to bypass its audio processing for this stream
    pub raw_mode: bool,

    /// Never convert this channel internally, regardless of engine policy
    pub forced_format: bool,

    /// Target sample rate in Hz
    pub sample_rate: u32,

    /// Target bit depth (16, 24 or 32)
    pub bit_depth: u16,

    /// Requested buffer duration in milliseconds
    pub buffer_ms: u32,

    pub share_mode: SharePreference,

    pub sync_mode: SyncPreference,

    pub alignment: BufferAlignment,

    pub resampler_quality: ResamplerQuality,

    /// Resample inside the pipeline even in shared mode
    pub force_internal_resampler: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            exclusive: false,
            raw_mode: false,
            forced_format: false,
            sample_rate: 48000,
            bit_depth: 24,
            buffer_ms: 20,
            share_mode: SharePreference::Auto,
            sync_mode: SyncPreference::Auto,
            alignment: BufferAlignment::Default,
            resampler_quality: ResamplerQuality::default(),
            force_internal_resampler: false,
        }
    }
}

impl ChannelConfig {
    /// Device identifier with empty strings treated as "default"
    pub fn device(&self) -> Option<&DeviceId> {
        self.device_id.as_ref().filter(|id| !id.is_default())
    }

    pub fn validate(&self, channel: ChannelId) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(MirrorError::invalid(channel, "sample rate must be greater than zero"));
        }

        if !SUPPORTED_BIT_DEPTHS.contains(&self.bit_depth) {
            return Err(MirrorError::invalid(
                channel,
                format!("bit depth {} is not one of 16, 24 or 32", self.bit_depth),
            ));
        }

        Ok(())
    }
}

/// Where the mirrored stream comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InputSelection {
    /// Loopback capture of the default render endpoint
    #[default]
    Loopback,
    /// An explicit capture endpoint, opened in shared mode
    Device(DeviceId),
}

/// Format requested from the capture endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InputFormatStrategy {
    /// Whatever the endpoint is mixing at
    #[default]
    SystemMix,
    /// A fixed format; drivers may refuse or ignore it
    Custom { sample_rate: u32, bit_depth: u16 },
    /// 32-bit float at the endpoint's rate when available
    PreferFloat32,
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub input: InputSelection,
    pub input_format: InputFormatStrategy,
    pub conversion: ConversionPolicy,
    pub main: ChannelConfig,
    pub aux: ChannelConfig,
}

impl EngineConfig {
    pub fn channel(&self, channel: ChannelId) -> &ChannelConfig {
        match channel {
            ChannelId::Main => &self.main,
            ChannelId::Aux => &self.aux,
        }
    }

    pub fn channel_mut(&mut self, channel: ChannelId) -> &mut ChannelConfig {
        match channel {
            ChannelId::Main => &mut self.main,
            ChannelId::Aux => &mut self.aux,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let InputFormatStrategy::Custom { sample_rate, bit_depth } = self.input_format {
            if sample_rate == 0 || !SUPPORTED_BIT_DEPTHS.contains(&bit_depth) {
                return Err(MirrorError::invalid(
                    Stage::Capture,
                    format!("custom capture format {sample_rate} Hz/{bit_depth}-bit is not valid"),
                ));
            }
        }

        for channel in ChannelId::ALL {
            self.channel(channel).validate(channel)?;
        }

        Ok(())
    }
}
