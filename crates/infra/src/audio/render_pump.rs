//! Per-channel low-latency render loop
//!
//! Each channel owns one pump thread. The thread opens the native render
//! client, initializes it, and then feeds the hardware buffer just in time
//! until asked to stop. The client never leaves that thread; the controller
//! talks to it over channels and observes it through [`PumpCounters`].
//!
//! ```text
//! Created --initialize--> Initialized --start--> Running --stop--> Stopped
//!    |                         |                                      ^
//!    +-------------------------+--------------(failure / stop)--------+
//! ```

use super::pcm::PcmSource;
use super::realtime::enable_realtime_audio_thread;
use audiomirror_core::{
    AudioBackend, ChannelId, ChannelPlan, Endpoint, MirrorError, NativeError, NativeErrorKind,
    NativeRenderClient, PcmFormat, PumpCounters, Result, ShareMode, Stage, SyncMode, WaitOutcome,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on one event wait, so stop requests are noticed during stalls
pub const WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// How long `stop()` waits for the pump thread before detaching it
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// Everything the pump thread needs to open its client
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub channel: ChannelId,
    pub endpoint: Endpoint,
    pub format: PcmFormat,
    pub share_mode: ShareMode,
    pub buffer_duration: Duration,
    pub sync_mode: SyncMode,
    pub raw: bool,
}

impl RenderSettings {
    pub fn from_plan(plan: &ChannelPlan, endpoint: Endpoint) -> Self {
        Self {
            channel: plan.channel,
            endpoint,
            format: plan.device_format,
            share_mode: plan.share_mode,
            buffer_duration: plan.buffer_duration,
            sync_mode: plan.sync_mode,
            raw: plan.raw,
        }
    }
}

enum Command {
    Start,
}

/// Controller for one channel's pump thread
pub struct RenderPump {
    channel: ChannelId,
    device: String,
    state: PumpState,
    buffer_frames: u32,
    shutdown: Arc<AtomicBool>,
    counters: Arc<PumpCounters>,
    commands: Option<Sender<Command>>,
    started: Option<Receiver<std::result::Result<(), NativeError>>>,
    done: Option<Receiver<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RenderPump {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            device: String::new(),
            state: PumpState::Created,
            buffer_frames: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(PumpCounters::new()),
            commands: None,
            started: None,
            done: None,
            thread: None,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    /// Hardware buffer size in frames, known once initialized
    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    pub fn counters(&self) -> Arc<PumpCounters> {
        Arc::clone(&self.counters)
    }

    /// Spawn the pump thread and open the device client on it
    ///
    /// Returns the hardware buffer size in frames. On failure the pump is
    /// `Stopped` and no device handle remains open.
    pub fn initialize(
        &mut self,
        backend: Arc<dyn AudioBackend>,
        settings: RenderSettings,
        source: Box<dyn PcmSource>,
    ) -> Result<u32> {
        if self.state != PumpState::Created {
            return Err(MirrorError::invalid(
                self.channel,
                format!("render pump cannot be initialized from {:?}", self.state),
            ));
        }

        self.device = settings.endpoint.name.clone();
        let (ready_tx, ready_rx) = channel::bounded(1);
        let (command_tx, command_rx) = channel::bounded(1);
        let (started_tx, started_rx) = channel::bounded(1);
        let (done_tx, done_rx) = channel::bounded::<()>(0);

        let context = PumpThread {
            backend,
            settings,
            source,
            shutdown: Arc::clone(&self.shutdown),
            counters: Arc::clone(&self.counters),
            ready: ready_tx,
            commands: command_rx,
            started: started_tx,
            _done: done_tx,
        };

        let thread = thread::Builder::new()
            .name(format!("audiomirror-render-{}", self.channel))
            .spawn(move || context.run())
            .map_err(|e| {
                self.state = PumpState::Stopped;
                MirrorError::NativeInitFailure {
                    stage: Stage::Channel(self.channel),
                    code: i64::from(e.raw_os_error().unwrap_or(0)),
                    detail: format!("failed to spawn render thread: {e}"),
                }
            })?;

        self.thread = Some(thread);
        self.commands = Some(command_tx);
        self.started = Some(started_rx);
        self.done = Some(done_rx);

        let outcome = ready_rx.recv().unwrap_or_else(|_| {
            Err(NativeError::new(
                NativeErrorKind::Other,
                "render thread exited during initialization",
            ))
        });

        match outcome {
            Ok(frames) => {
                self.buffer_frames = frames;
                self.state = PumpState::Initialized;
                debug!(channel = %self.channel, buffer_frames = frames, "render pump initialized");
                Ok(frames)
            }
            Err(e) => {
                self.stop();
                Err(MirrorError::from_native(self.channel, self.device.clone(), e))
            }
        }
    }

    /// Start the device client and enter the render loop
    pub fn start(&mut self) -> Result<()> {
        if self.state != PumpState::Initialized {
            return Err(MirrorError::invalid(
                self.channel,
                format!("render pump cannot be started from {:?}", self.state),
            ));
        }

        let sent = self
            .commands
            .as_ref()
            .map(|tx| tx.send(Command::Start).is_ok())
            .unwrap_or(false);
        let outcome = match (sent, self.started.as_ref()) {
            (true, Some(rx)) => rx.recv().unwrap_or_else(|_| {
                Err(NativeError::new(NativeErrorKind::Other, "render thread exited before starting"))
            }),
            _ => Err(NativeError::new(NativeErrorKind::Other, "render thread is not available")),
        };

        match outcome {
            Ok(()) => {
                self.state = PumpState::Running;
                info!(channel = %self.channel, device = %self.device, "render pump running");
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(MirrorError::from_native(self.channel, self.device.clone(), e))
            }
        }
    }

    /// Stop the loop and release the device client. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.state == PumpState::Stopped {
            return;
        }
        let was_running = self.state == PumpState::Running;

        self.shutdown.store(true, Ordering::Release);
        // Dropping the command sender aborts a thread still waiting for Start
        self.commands = None;
        self.started = None;

        if let Some(done) = self.done.take() {
            match done.recv_timeout(JOIN_TIMEOUT) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        channel = %self.channel,
                        timeout_ms = JOIN_TIMEOUT.as_millis() as u64,
                        "render thread did not exit in time; detaching it"
                    );
                    self.thread = None;
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if let Some(thread) = self.thread.take() {
                        if thread.join().is_err() {
                            warn!(channel = %self.channel, "render thread panicked");
                        }
                    }
                }
            }
        }

        self.state = PumpState::Stopped;
        if was_running {
            info!(
                channel = %self.channel,
                frames_rendered = self.counters.frames_rendered(),
                underruns = self.counters.underruns(),
                "render pump stopped"
            );
        }
    }
}

impl Drop for RenderPump {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the pump thread
struct PumpThread {
    backend: Arc<dyn AudioBackend>,
    settings: RenderSettings,
    source: Box<dyn PcmSource>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<PumpCounters>,
    ready: Sender<std::result::Result<u32, NativeError>>,
    commands: Receiver<Command>,
    started: Sender<std::result::Result<(), NativeError>>,
    /// Dropped when the thread exits, which the controller observes
    _done: Sender<()>,
}

impl PumpThread {
    fn run(mut self) {
        let _realtime = enable_realtime_audio_thread();
        let channel = self.settings.channel;

        let (mut client, buffer_frames) = match self.open_client() {
            Ok(opened) => {
                let _ = self.ready.send(Ok(opened.1));
                opened
            }
            Err(e) => {
                let _ = self.ready.send(Err(e));
                return;
            }
        };

        // Anything but Start means the controller gave up on this channel
        if !matches!(self.commands.recv(), Ok(Command::Start)) {
            debug!(channel = %channel, "render pump aborted before start");
            return;
        }

        if let Err(e) = client.start() {
            let _ = self.started.send(Err(e));
            return;
        }
        let _ = self.started.send(Ok(()));

        if let Err(e) = self.pump(client.as_mut(), buffer_frames) {
            error!(channel = %channel, error = %e, "render loop failed; channel stopped");
            self.counters.mark_faulted();
        }

        if let Err(e) = client.stop() {
            warn!(channel = %channel, error = %e, "failed to stop render client");
        }
        drop(client);
        debug!(channel = %channel, "render client released");
    }

    fn open_client(&self) -> std::result::Result<(Box<dyn NativeRenderClient>, u32), NativeError> {
        let settings = &self.settings;
        let mut client = self.backend.open_render_client(&settings.endpoint)?;

        if settings.raw {
            if let Err(e) = client.set_raw_processing(true) {
                warn!(channel = %settings.channel, error = %e, "RAW processing not applied");
            }
        }

        client.initialize(
            &settings.format,
            settings.share_mode,
            settings.buffer_duration,
            settings.sync_mode,
        )?;
        let frames = client.buffer_size()?;

        debug!(
            channel = %settings.channel,
            device = %settings.endpoint.name,
            format = %settings.format,
            share_mode = %settings.share_mode,
            buffer_frames = frames,
            "render client initialized"
        );
        Ok((client, frames))
    }

    fn pump(
        &mut self,
        client: &mut dyn NativeRenderClient,
        buffer_frames: u32,
    ) -> std::result::Result<(), NativeError> {
        let channel = self.settings.channel;
        let block = self.settings.format.block_align();
        let poll_interval = self.settings.buffer_duration / 2;
        let mut staging = vec![0u8; buffer_frames as usize * block];

        while !self.shutdown.load(Ordering::Acquire) {
            match self.settings.sync_mode {
                SyncMode::Event => {
                    if client.wait(WAIT_TIMEOUT)? == WaitOutcome::TimedOut {
                        continue;
                    }
                }
                SyncMode::Polling => thread::sleep(poll_interval),
            }

            let padding = client.current_padding()?;
            let free = buffer_frames.saturating_sub(padding) as usize;
            if free == 0 {
                continue;
            }

            let read = self.source.read(&mut staging[..free * block]);
            let frames = read / block;
            if frames == 0 {
                // Starved: write nothing rather than stale data
                self.counters.record_underrun();
                trace!(channel = %channel, free, "render underrun");
                continue;
            }

            let bytes = frames * block;
            let buffer = client.get_buffer(frames as u32)?;
            if buffer.len() < bytes {
                return Err(NativeError::new(
                    NativeErrorKind::Other,
                    format!("device buffer holds {} bytes, expected {bytes}", buffer.len()),
                ));
            }
            buffer[..bytes].copy_from_slice(&staging[..bytes]);
            client.release_buffer(frames as u32)?;
            self.counters.record_frames(frames as u64);
        }

        Ok(())
    }
}
