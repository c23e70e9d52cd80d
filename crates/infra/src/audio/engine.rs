//! Mirror engine
//!
//! Sequences the whole pipeline: capture, fan-out, per-channel negotiation,
//! optional resampling and the two render pumps. Startup is all-or-nothing;
//! a failure at any step releases everything acquired so far, in reverse
//! order, before the originating error is returned.

use super::capture::CaptureSource;
use super::fanout::{FanoutBuffer, DEFAULT_FANOUT_CAPACITY};
use super::pcm::{PcmSource, QueueSource};
use super::render_pump::{RenderPump, RenderSettings};
use super::resampler::ResamplingStage;
use audiomirror_core::{
    AudioBackend, ChannelConfig, ChannelId, ChannelPlan, ChannelRuntimeState, Direction, EngineConfig,
    Endpoint, FormatNegotiator, MirrorError, PcmFormat, PumpCounters, Result, StatusReporter,
    StatusSnapshot,
};
use std::sync::Arc;
use tracing::{info, warn};

/// A started channel and everything it owns
struct ActiveChannel {
    pump: RenderPump,
    counters: Arc<PumpCounters>,
    state: ChannelRuntimeState,
}

/// Mirrors one captured stream to the main and aux outputs
pub struct MirrorEngine {
    backend: Arc<dyn AudioBackend>,
    config: EngineConfig,
    capture: Option<CaptureSource>,
    channels: [Option<ActiveChannel>; 2],
}

impl MirrorEngine {
    pub fn new(backend: Arc<dyn AudioBackend>, config: EngineConfig) -> Self {
        Self {
            backend,
            config,
            capture: None,
            channels: [None, None],
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.capture.is_some()
    }

    /// Format the capture device actually delivers, while running
    pub fn capture_format(&self) -> Option<PcmFormat> {
        self.capture.as_ref().map(CaptureSource::format)
    }

    /// Start capture and both channels
    ///
    /// Starting a running engine is a caller error and returns
    /// [`MirrorError::AlreadyRunning`] without touching the running pipeline.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(MirrorError::AlreadyRunning);
        }
        // Leftovers from a start that failed after partial teardown
        self.teardown();

        info!("starting mirror engine");
        match self.try_start() {
            Ok(()) => {
                info!("mirror engine running");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "mirror engine failed to start; rolling back");
                self.teardown();
                Err(e)
            }
        }
    }

    fn try_start(&mut self) -> Result<()> {
        self.config.validate()?;

        let capture = CaptureSource::open(
            self.backend.as_ref(),
            &self.config.input,
            self.config.input_format,
            DEFAULT_FANOUT_CAPACITY,
        )?;
        let source_format = capture.format();
        let fanout = capture.fanout();
        self.capture = Some(capture);

        // Both channels are negotiated before any render device is opened, so
        // a format conflict never leaves an exclusive lock behind
        let negotiator = FormatNegotiator::new(self.config.conversion);
        let mut planned = Vec::with_capacity(ChannelId::ALL.len());
        for channel in ChannelId::ALL {
            let config = self.config.channel(channel);
            let endpoint = self
                .backend
                .resolve(Direction::Render, config.device())
                .map_err(|e| MirrorError::from_native(channel, device_label(config), e))?;
            let device_mix = self.backend.mix_format(&endpoint);
            let plan = negotiator.negotiate(channel, &source_format, config, device_mix)?;
            planned.push((endpoint, plan));
        }

        for (endpoint, plan) in planned {
            let channel = plan.channel;
            let active = self.start_channel(Arc::clone(&fanout), endpoint, &plan)?;
            self.channels[channel.index()] = Some(active);
        }

        Ok(())
    }

    fn start_channel(
        &self,
        fanout: Arc<FanoutBuffer>,
        endpoint: Endpoint,
        plan: &ChannelPlan,
    ) -> Result<ActiveChannel> {
        let channel = plan.channel;
        let mut source: Box<dyn PcmSource> = Box::new(QueueSource::new(fanout, channel, plan.source));
        if let Some(resampler) = &plan.resampler {
            let stage = ResamplingStage::new(source, resampler)
                .map_err(|e| MirrorError::invalid(channel, e.to_string()))?;
            source = Box::new(stage);
        }

        let device = endpoint.name.clone();
        let mut pump = RenderPump::new(channel);
        let buffer_frames = pump.initialize(
            Arc::clone(&self.backend),
            RenderSettings::from_plan(plan, endpoint),
            source,
        )?;
        pump.start()?;

        let state = ChannelRuntimeState::from_plan(plan, buffer_frames);
        info!(
            channel = %channel,
            device = %device,
            share_mode = %plan.share_mode,
            format = %plan.device_format,
            resampler = plan.uses_resampler(),
            multi_stage_src = state.multi_stage_suspected(),
            "channel started"
        );

        Ok(ActiveChannel {
            counters: pump.counters(),
            pump,
            state,
        })
    }

    /// Stop both channels and the capture. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.is_running() || self.channels.iter().any(Option::is_some) {
            info!("stopping mirror engine");
            self.teardown();
            info!("mirror engine stopped");
        }
    }

    /// Release in reverse acquisition order: aux, main, capture
    fn teardown(&mut self) {
        for channel in ChannelId::ALL.iter().rev() {
            if let Some(mut active) = self.channels[channel.index()].take() {
                active.pump.stop();
            }
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }

    /// Replace the configuration with a full stop/start cycle
    pub fn apply_config(&mut self, config: EngineConfig) -> Result<()> {
        self.stop();
        self.config = config;
        self.start()
    }

    /// Current status, derived from live state on every call
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let status = |channel: ChannelId| {
            let active = self.channels[channel.index()].as_ref();
            StatusReporter::channel_status(
                active.map(|a| &a.state),
                active.map(|a| a.counters.as_ref()),
            )
        };

        StatusSnapshot {
            main: status(ChannelId::Main),
            aux: status(ChannelId::Aux),
        }
    }
}

impl Drop for MirrorEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn device_label(config: &ChannelConfig) -> String {
    config
        .device()
        .map_or_else(|| "default render endpoint".to_string(), ToString::to_string)
}
