//! Per-channel format negotiation
//!
//! Given the captured format and a channel's configuration, decides the share
//! mode, the format opened on the device, whether an internal resampling
//! stage is needed, and whether startup must abort on a format mismatch.
//! Negotiation is pure; it runs for both channels before any render device is
//! opened.

use crate::domain::config::{
    BufferAlignment, ChannelConfig, ConversionPolicy, ResamplerQuality, SharePreference,
    SyncPreference,
};
use crate::domain::device::{ChannelId, ShareMode, SyncMode};
use crate::domain::error::{MirrorError, Result};
use crate::domain::format::PcmFormat;
use std::time::Duration;
use tracing::debug;

/// Generic buffer duration range in milliseconds
pub const MIN_BUFFER_MS: u32 = 2;
pub const MAX_BUFFER_MS: u32 = 1000;

/// Floor applied by [`BufferAlignment::Minimum`]
pub const MIN_ALIGNED_BUFFER_MS: u32 = 12;

/// Shared-mode target rate when the device does not report a mix format
pub const FALLBACK_SHARED_RATE: u32 = 48000;

/// Conversion performed inside the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResamplerPlan {
    pub from: PcmFormat,
    pub to: PcmFormat,
    pub quality: ResamplerQuality,
}

/// Outcome of negotiating one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPlan {
    pub channel: ChannelId,
    /// Captured format
    pub source: PcmFormat,
    /// Negotiated target format
    pub target: PcmFormat,
    /// Format actually opened on the device
    pub device_format: PcmFormat,
    pub share_mode: ShareMode,
    pub sync_mode: SyncMode,
    pub buffer_duration: Duration,
    pub raw: bool,
    pub resampler: Option<ResamplerPlan>,
    /// Device mix format, when the device reported one
    pub device_mix: Option<PcmFormat>,
}

impl ChannelPlan {
    pub fn uses_resampler(&self) -> bool {
        self.resampler.is_some()
    }
}

/// Clamp a requested buffer duration and apply the alignment rule
pub fn effective_buffer_duration(buffer_ms: u32, alignment: BufferAlignment) -> Duration {
    let clamped = buffer_ms.clamp(MIN_BUFFER_MS, MAX_BUFFER_MS);
    let ms = match alignment {
        BufferAlignment::Default => clamped,
        BufferAlignment::Minimum => clamped.max(MIN_ALIGNED_BUFFER_MS),
    };
    Duration::from_millis(u64::from(ms))
}

/// Decides device formats and conversion for each channel
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatNegotiator {
    policy: ConversionPolicy,
}

impl FormatNegotiator {
    pub fn new(policy: ConversionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConversionPolicy {
        self.policy
    }

    /// A strict channel is never converted inside the pipeline
    pub fn is_strict(&self, config: &ChannelConfig) -> bool {
        self.policy == ConversionPolicy::Strict || config.forced_format
    }

    pub fn negotiate(
        &self,
        channel: ChannelId,
        source: &PcmFormat,
        config: &ChannelConfig,
        device_mix: Option<PcmFormat>,
    ) -> Result<ChannelPlan> {
        let share_mode = resolve_share_mode(config);
        let sync_mode = resolve_sync_mode(config.sync_mode);
        let strict = self.is_strict(config);

        let (target, device_format, resampler) = match share_mode {
            ShareMode::Exclusive => {
                let target = PcmFormat::matching_encoding(config.sample_rate, config.bit_depth, source);

                let resampler = if *source == target {
                    None
                } else if strict {
                    return Err(MirrorError::FormatMismatch {
                        channel,
                        source_format: *source,
                        target,
                    });
                } else {
                    Some(ResamplerPlan {
                        from: *source,
                        to: target,
                        quality: config.resampler_quality,
                    })
                };

                (target, target, resampler)
            }
            ShareMode::Shared => {
                let target = match device_mix {
                    Some(mix) => PcmFormat::matching_encoding(mix.sample_rate, config.bit_depth, &mix),
                    None => PcmFormat::matching_encoding(FALLBACK_SHARED_RATE, config.bit_depth, source),
                };

                // The force flag applies under any conversion policy
                if config.force_internal_resampler && *source != target {
                    let plan = ResamplerPlan {
                        from: *source,
                        to: target,
                        quality: config.resampler_quality,
                    };
                    (target, target, Some(plan))
                } else {
                    (target, *source, None)
                }
            }
        };

        let plan = ChannelPlan {
            channel,
            source: *source,
            target,
            device_format,
            share_mode,
            sync_mode,
            buffer_duration: effective_buffer_duration(config.buffer_ms, config.alignment),
            raw: config.raw_mode,
            resampler,
            device_mix,
        };

        debug!(
            channel = %channel,
            share_mode = %plan.share_mode,
            source = %plan.source,
            device_format = %plan.device_format,
            resampler = plan.uses_resampler(),
            buffer_ms = plan.buffer_duration.as_millis() as u64,
            "channel negotiated"
        );

        Ok(plan)
    }
}

fn resolve_share_mode(config: &ChannelConfig) -> ShareMode {
    match config.share_mode {
        SharePreference::Exclusive => ShareMode::Exclusive,
        SharePreference::Shared => ShareMode::Shared,
        SharePreference::Auto if config.exclusive => ShareMode::Exclusive,
        SharePreference::Auto => ShareMode::Shared,
    }
}

fn resolve_sync_mode(preference: SyncPreference) -> SyncMode {
    match preference {
        SyncPreference::Polling => SyncMode::Polling,
        SyncPreference::Auto | SyncPreference::Event => SyncMode::Event,
    }
}
