//! Status introspection
//!
//! Snapshots are derived on demand from the live runtime state of each
//! channel and its pump counters. Nothing here is cached.

use crate::domain::device::{ChannelId, ShareMode};
use crate::domain::format::PcmFormat;
use crate::domain::negotiation::ChannelPlan;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// What a started channel is actually doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRuntimeState {
    pub share_mode: ShareMode,
    /// Format the device was opened with
    pub device_format: PcmFormat,
    pub source_format: PcmFormat,
    pub target_format: PcmFormat,
    /// Output format of the internal resampling stage, if one is active
    pub resampler_output: Option<PcmFormat>,
    pub device_mix: Option<PcmFormat>,
    /// Hardware buffer size in frames
    pub buffer_frames: u32,
}

impl ChannelRuntimeState {
    pub fn from_plan(plan: &ChannelPlan, buffer_frames: u32) -> Self {
        Self {
            share_mode: plan.share_mode,
            device_format: plan.device_format,
            source_format: plan.source,
            target_format: plan.target,
            resampler_output: plan.resampler.map(|r| r.to),
            device_mix: plan.device_mix,
            buffer_frames,
        }
    }

    pub fn internal_resampler(&self) -> bool {
        self.resampler_output.is_some()
    }

    /// Whether the device is likely converting the stream a second time
    ///
    /// Exclusive streams are never converted by the device. A shared stream is
    /// suspect when the format fed to it differs from the device mix format,
    /// or from the negotiated target when the mix format is unknown.
    pub fn multi_stage_suspected(&self) -> bool {
        match self.share_mode {
            ShareMode::Exclusive => false,
            ShareMode::Shared => {
                let reference = self.device_mix.unwrap_or(self.target_format);
                self.device_format != reference
            }
        }
    }
}

/// Counters updated by a render pump thread
#[derive(Debug, Default)]
pub struct PumpCounters {
    underruns: AtomicU64,
    frames_rendered: AtomicU64,
    faulted: AtomicBool,
}

impl PumpCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frames(&self, frames: u64) {
        self.frames_rendered.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChannelStatus {
    pub running: bool,
    pub internal_resampler: bool,
    pub multi_stage_src: bool,
    pub underruns: u64,
    pub frames_rendered: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusSnapshot {
    pub main: ChannelStatus,
    pub aux: ChannelStatus,
}

impl StatusSnapshot {
    pub fn channel(&self, channel: ChannelId) -> &ChannelStatus {
        match channel {
            ChannelId::Main => &self.main,
            ChannelId::Aux => &self.aux,
        }
    }
}

/// Derives [`ChannelStatus`] values
pub struct StatusReporter;

impl StatusReporter {
    /// Status of one channel; `None` state means the channel is not started
    pub fn channel_status(
        state: Option<&ChannelRuntimeState>,
        counters: Option<&PumpCounters>,
    ) -> ChannelStatus {
        let Some(state) = state else {
            return ChannelStatus::default();
        };

        ChannelStatus {
            running: counters.map_or(true, |c| !c.is_faulted()),
            internal_resampler: state.internal_resampler(),
            multi_stage_src: state.multi_stage_suspected(),
            underruns: counters.map_or(0, PumpCounters::underruns),
            frames_rendered: counters.map_or(0, PumpCounters::frames_rendered),
        }
    }
}
