//! Deterministic in-memory backend
//!
//! Used by tests and dry runs. Every opened handle is counted, every render
//! initialization is recorded, and rendered bytes are kept per device so
//! callers can check exactly what reached each output.

use audiomirror_core::{
    AudioBackend, CaptureCallback, CaptureHandle, CaptureRequest, DeviceDirectory, DeviceId,
    Direction, Endpoint, InputFormatStrategy, NativeError, NativeErrorKind, NativeRenderClient,
    PcmFormat, ShareMode, SyncMode, WaitOutcome,
};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// One `initialize` call seen by a fake render client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedInit {
    pub device: DeviceId,
    pub format: PcmFormat,
    pub share_mode: ShareMode,
    pub buffer_duration: Duration,
    pub sync_mode: SyncMode,
    pub raw: bool,
}

#[derive(Default)]
struct FakeState {
    render_endpoints: Vec<Endpoint>,
    capture_endpoints: Vec<Endpoint>,
    capture_format: Option<PcmFormat>,
    honour_custom_format: bool,
    mix_formats: HashMap<DeviceId, PcmFormat>,

    capture_failure: Option<NativeError>,
    init_failures: HashMap<DeviceId, NativeError>,
    start_failures: HashMap<DeviceId, NativeError>,

    captures_opened: usize,
    render_clients_opened: usize,
    open_handles: usize,

    capture_callback: Option<CaptureCallback>,
    capturing: bool,

    initializations: Vec<RecordedInit>,
    rendered: HashMap<DeviceId, Vec<u8>>,
}

type Shared = Arc<Mutex<FakeState>>;

fn lock(state: &Shared) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`AudioBackend`]
///
/// Defaults: render endpoints `speakers` (default) and `spdif`, capture
/// endpoint `line-in`, capture format 48000 Hz/16-bit, no mix formats.
#[derive(Clone)]
pub struct FakeBackend {
    state: Shared,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        let state = FakeState {
            capture_format: Some(PcmFormat::int(48000, 16)),
            honour_custom_format: true,
            ..Default::default()
        };
        let backend = Self {
            state: Arc::new(Mutex::new(state)),
        };
        backend
            .with_render_endpoint("speakers", "Speakers")
            .with_render_endpoint("spdif", "S/PDIF Out")
            .with_capture_endpoint("line-in", "Line In")
    }

    /// Add a render endpoint; the first one added is the default
    pub fn with_render_endpoint(self, id: &str, name: &str) -> Self {
        lock(&self.state).render_endpoints.push(Endpoint {
            id: DeviceId::new(id),
            name: name.to_string(),
            direction: Direction::Render,
        });
        self
    }

    pub fn with_capture_endpoint(self, id: &str, name: &str) -> Self {
        lock(&self.state).capture_endpoints.push(Endpoint {
            id: DeviceId::new(id),
            name: name.to_string(),
            direction: Direction::Capture,
        });
        self
    }

    /// Format delivered by capture under the system-mix strategy
    pub fn with_capture_format(self, format: PcmFormat) -> Self {
        lock(&self.state).capture_format = Some(format);
        self
    }

    /// Behave like a driver that ignores custom capture formats
    pub fn ignoring_custom_format(self) -> Self {
        lock(&self.state).honour_custom_format = false;
        self
    }

    pub fn with_mix_format(self, device: &str, format: PcmFormat) -> Self {
        lock(&self.state).mix_formats.insert(DeviceId::new(device), format);
        self
    }

    pub fn failing_capture(self, error: NativeError) -> Self {
        lock(&self.state).capture_failure = Some(error);
        self
    }

    pub fn failing_initialize(self, device: &str, error: NativeError) -> Self {
        lock(&self.state).init_failures.insert(DeviceId::new(device), error);
        self
    }

    pub fn failing_start(self, device: &str, error: NativeError) -> Self {
        lock(&self.state).start_failures.insert(DeviceId::new(device), error);
        self
    }

    /// Deliver a block through the capture callback, as the audio subsystem
    /// would. Returns false when no capture is running.
    pub fn inject_capture(&self, bytes: &[u8]) -> bool {
        let mut state = lock(&self.state);
        if !state.capturing {
            return false;
        }
        match state.capture_callback.as_mut() {
            Some(callback) => {
                callback(bytes);
                true
            }
            None => false,
        }
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.state).capturing
    }

    pub fn captures_opened(&self) -> usize {
        lock(&self.state).captures_opened
    }

    pub fn render_clients_opened(&self) -> usize {
        lock(&self.state).render_clients_opened
    }

    /// Capture handles and render clients currently alive
    pub fn open_handles(&self) -> usize {
        lock(&self.state).open_handles
    }

    pub fn initializations(&self) -> Vec<RecordedInit> {
        lock(&self.state).initializations.clone()
    }

    pub fn rendered_bytes(&self, device: &str) -> Vec<u8> {
        lock(&self.state)
            .rendered
            .get(&DeviceId::new(device))
            .cloned()
            .unwrap_or_default()
    }
}

impl DeviceDirectory for FakeBackend {
    fn default_endpoint(&self, direction: Direction) -> Result<Endpoint, NativeError> {
        let state = lock(&self.state);
        let endpoints = match direction {
            Direction::Render => &state.render_endpoints,
            Direction::Capture => &state.capture_endpoints,
        };
        endpoints
            .first()
            .cloned()
            .ok_or_else(|| NativeError::new(NativeErrorKind::DeviceNotFound, "no default endpoint"))
    }

    fn find_endpoint(&self, direction: Direction, id: &DeviceId) -> Result<Endpoint, NativeError> {
        let state = lock(&self.state);
        let endpoints = match direction {
            Direction::Render => &state.render_endpoints,
            Direction::Capture => &state.capture_endpoints,
        };
        endpoints
            .iter()
            .find(|endpoint| endpoint.id == *id)
            .cloned()
            .ok_or_else(|| NativeError::new(NativeErrorKind::DeviceNotFound, format!("no endpoint '{id}'")))
    }
}

impl AudioBackend for FakeBackend {
    fn mix_format(&self, endpoint: &Endpoint) -> Option<PcmFormat> {
        lock(&self.state).mix_formats.get(&endpoint.id).copied()
    }

    fn open_capture(
        &self,
        request: &CaptureRequest,
        on_data: CaptureCallback,
    ) -> Result<Box<dyn CaptureHandle>, NativeError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.capture_failure.clone() {
            return Err(error);
        }

        let native = state
            .capture_format
            .ok_or_else(|| NativeError::new(NativeErrorKind::FormatRejected, "no capture format"))?;
        let format = match request.format {
            InputFormatStrategy::Custom {
                sample_rate,
                bit_depth,
            } if state.honour_custom_format => PcmFormat::int(sample_rate, bit_depth),
            InputFormatStrategy::PreferFloat32 => PcmFormat::float32(native.sample_rate),
            _ => native,
        };

        state.captures_opened += 1;
        state.open_handles += 1;
        state.capture_callback = Some(on_data);

        Ok(Box::new(FakeCapture {
            state: Arc::clone(&self.state),
            format,
        }))
    }

    fn open_render_client(&self, endpoint: &Endpoint) -> Result<Box<dyn NativeRenderClient>, NativeError> {
        let mut state = lock(&self.state);
        if !state.render_endpoints.iter().any(|e| e.id == endpoint.id) {
            return Err(NativeError::new(NativeErrorKind::DeviceNotFound, endpoint.id.to_string()));
        }
        state.render_clients_opened += 1;
        state.open_handles += 1;

        Ok(Box::new(FakeRenderClient {
            state: Arc::clone(&self.state),
            device: endpoint.id.clone(),
            raw: false,
            format: None,
            buffer: Vec::new(),
            buffer_frames: 0,
            padding: Cell::new(0),
            running: false,
        }))
    }
}

struct FakeCapture {
    state: Shared,
    format: PcmFormat,
}

impl CaptureHandle for FakeCapture {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), NativeError> {
        lock(&self.state).capturing = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NativeError> {
        lock(&self.state).capturing = false;
        Ok(())
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.capturing = false;
        state.capture_callback = None;
        state.open_handles -= 1;
    }
}

/// Plays everything instantly: queued frames are reported once as padding
/// and then considered played.
struct FakeRenderClient {
    state: Shared,
    device: DeviceId,
    raw: bool,
    format: Option<PcmFormat>,
    buffer: Vec<u8>,
    buffer_frames: u32,
    padding: Cell<u32>,
    running: bool,
}

impl FakeRenderClient {
    fn not_initialized() -> NativeError {
        NativeError::new(NativeErrorKind::Other, "client not initialized")
    }
}

impl NativeRenderClient for FakeRenderClient {
    fn set_raw_processing(&mut self, enabled: bool) -> Result<(), NativeError> {
        self.raw = enabled;
        Ok(())
    }

    fn initialize(
        &mut self,
        format: &PcmFormat,
        share_mode: ShareMode,
        buffer_duration: Duration,
        sync: SyncMode,
    ) -> Result<(), NativeError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.init_failures.get(&self.device) {
            return Err(error.clone());
        }

        let frames = format.frames_for(buffer_duration).max(1) as u32;
        self.format = Some(*format);
        self.buffer_frames = frames;
        self.buffer = vec![0; format.frames_to_bytes(frames as usize)];

        state.initializations.push(RecordedInit {
            device: self.device.clone(),
            format: *format,
            share_mode,
            buffer_duration,
            sync_mode: sync,
            raw: self.raw,
        });
        Ok(())
    }

    fn buffer_size(&self) -> Result<u32, NativeError> {
        match self.format {
            Some(_) => Ok(self.buffer_frames),
            None => Err(Self::not_initialized()),
        }
    }

    fn current_padding(&self) -> Result<u32, NativeError> {
        Ok(self.padding.replace(0))
    }

    fn wait(&mut self, timeout: Duration) -> Result<WaitOutcome, NativeError> {
        if !self.running {
            thread::sleep(timeout);
            return Ok(WaitOutcome::TimedOut);
        }
        thread::sleep(Duration::from_millis(1));
        Ok(WaitOutcome::Ready)
    }

    fn get_buffer(&mut self, frames: u32) -> Result<&mut [u8], NativeError> {
        let format = self.format.ok_or_else(Self::not_initialized)?;
        if frames > self.buffer_frames - self.padding.get() {
            return Err(NativeError::new(
                NativeErrorKind::Other,
                format!("requested {frames} frames with {} free", self.buffer_frames - self.padding.get()),
            ));
        }
        let bytes = format.frames_to_bytes(frames as usize);
        Ok(&mut self.buffer[..bytes])
    }

    fn release_buffer(&mut self, frames: u32) -> Result<(), NativeError> {
        let format = self.format.ok_or_else(Self::not_initialized)?;
        let bytes = format.frames_to_bytes(frames as usize);
        lock(&self.state)
            .rendered
            .entry(self.device.clone())
            .or_default()
            .extend_from_slice(&self.buffer[..bytes]);
        self.padding.set(self.padding.get() + frames);
        Ok(())
    }

    fn start(&mut self) -> Result<(), NativeError> {
        if let Some(error) = lock(&self.state).start_failures.get(&self.device) {
            return Err(error.clone());
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NativeError> {
        self.running = false;
        Ok(())
    }
}

impl Drop for FakeRenderClient {
    fn drop(&mut self) {
        lock(&self.state).open_handles -= 1;
    }
}
