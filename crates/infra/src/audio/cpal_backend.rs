//! CPAL-based audio backend
//!
//! Provides the pipeline's device interfaces on top of CPAL, which abstracts
//! the platform APIs (WASAPI, ALSA/PulseAudio, CoreAudio).
//!
//! CPAL only exposes shared-mode streams, so exclusive requests are refused
//! with [`NativeErrorKind::ExclusiveUnsupported`]. The render client emulates
//! a hardware ring buffer: the pump writes into a byte ring sized from the
//! requested buffer duration, the CPAL output callback drains it and then
//! signals the wait event.

use super::fanout::ByteQueue;
use super::pcm::SampleLayout;
use audiomirror_core::{
    AudioBackend, CaptureCallback, CaptureHandle, CaptureRequest, DeviceDirectory, DeviceId,
    Direction, Endpoint, InputFormatStrategy, NativeError, NativeErrorKind, NativeRenderClient,
    PcmFormat, ShareMode, SyncMode, WaitOutcome, CHANNEL_COUNT,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

fn native(kind: NativeErrorKind, context: &str, err: impl fmt::Display) -> NativeError {
    NativeError::new(kind, format!("{context}: {err}"))
}

fn build_error(err: cpal::BuildStreamError) -> NativeError {
    let kind = match err {
        cpal::BuildStreamError::DeviceNotAvailable => NativeErrorKind::DeviceInvalidated,
        cpal::BuildStreamError::StreamConfigNotSupported => NativeErrorKind::FormatRejected,
        _ => NativeErrorKind::Other,
    };
    native(kind, "failed to build stream", err)
}

#[allow(deprecated)]
fn device_name(device: &cpal::Device) -> String {
    device.name().unwrap_or_else(|_| "Unknown Device".to_string())
}

/// PCM format carried by a CPAL sample format, if the codec supports it
fn pcm_format(sample_format: cpal::SampleFormat, sample_rate: u32) -> Option<PcmFormat> {
    match sample_format {
        cpal::SampleFormat::I16 => Some(PcmFormat::int(sample_rate, 16)),
        cpal::SampleFormat::I32 => Some(PcmFormat::int(sample_rate, 32)),
        cpal::SampleFormat::F32 => Some(PcmFormat::float32(sample_rate)),
        _ => None,
    }
}

/// CPAL sample format matching a PCM format, if any
fn sample_format_for(format: &PcmFormat) -> Option<cpal::SampleFormat> {
    match SampleLayout::of(format)? {
        SampleLayout::I16 => Some(cpal::SampleFormat::I16),
        SampleLayout::I32 => Some(cpal::SampleFormat::I32),
        SampleLayout::F32 => Some(cpal::SampleFormat::F32),
        SampleLayout::I24 => None,
    }
}

/// [`AudioBackend`] over the default CPAL host
///
/// Device names double as device identifiers.
pub struct CpalBackend {
    host_id: cpal::HostId,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        let host = cpal::default_host();
        info!(host = ?host.id(), "using audio host");
        Self { host_id: host.id() }
    }

    fn host(&self) -> Result<cpal::Host, NativeError> {
        cpal::host_from_id(self.host_id).map_err(|e| native(NativeErrorKind::Other, "audio host unavailable", e))
    }

    fn endpoint(device: &cpal::Device, direction: Direction) -> Endpoint {
        let name = device_name(device);
        Endpoint {
            id: DeviceId::new(name.clone()),
            name,
            direction,
        }
    }

    /// CPAL device behind an endpoint
    fn device(&self, endpoint: &Endpoint) -> Result<cpal::Device, NativeError> {
        let host = self.host()?;
        let mut devices = match endpoint.direction {
            Direction::Render => host.output_devices(),
            Direction::Capture => host.input_devices(),
        }
        .map_err(|e| native(NativeErrorKind::Other, "failed to enumerate devices", e))?;

        devices
            .find(|d| device_name(d) == endpoint.id.as_str())
            .ok_or_else(|| NativeError::new(NativeErrorKind::DeviceNotFound, format!("no device '{}'", endpoint.id)))
    }

    /// Stream configuration for capture under the requested strategy
    fn capture_config(
        device: &cpal::Device,
        loopback: bool,
        strategy: InputFormatStrategy,
    ) -> Result<cpal::SupportedStreamConfig, NativeError> {
        let default = if loopback {
            device.default_output_config()
        } else {
            device.default_input_config()
        }
        .map_err(|e| native(NativeErrorKind::FormatRejected, "no default capture format", e))?;

        let wanted = match strategy {
            InputFormatStrategy::SystemMix => return Ok(default),
            InputFormatStrategy::Custom {
                sample_rate,
                bit_depth,
            } => PcmFormat::int(sample_rate, bit_depth),
            InputFormatStrategy::PreferFloat32 => PcmFormat::float32(default.sample_rate()),
        };
        let Some(sample_format) = sample_format_for(&wanted) else {
            return Ok(default);
        };

        let ranges = if loopback {
            device.supported_output_configs().map(|r| r.collect::<Vec<_>>())
        } else {
            device.supported_input_configs().map(|r| r.collect::<Vec<_>>())
        };

        // Drivers may not offer the requested format; the caller compares the
        // actual format and warns
        let matching = ranges.ok().and_then(|ranges| {
            ranges.into_iter().find(|range| {
                range.sample_format() == sample_format
                    && range.min_sample_rate() <= wanted.sample_rate
                    && range.max_sample_rate() >= wanted.sample_rate
            })
        });

        Ok(match matching {
            Some(range) => range.with_sample_rate(wanted.sample_rate),
            None => default,
        })
    }
}

impl DeviceDirectory for CpalBackend {
    fn default_endpoint(&self, direction: Direction) -> Result<Endpoint, NativeError> {
        let host = self.host()?;
        let device = match direction {
            Direction::Render => host.default_output_device(),
            Direction::Capture => host.default_input_device(),
        }
        .ok_or_else(|| NativeError::new(NativeErrorKind::DeviceNotFound, "no default device"))?;

        Ok(Self::endpoint(&device, direction))
    }

    fn find_endpoint(&self, direction: Direction, id: &DeviceId) -> Result<Endpoint, NativeError> {
        let probe = Endpoint {
            id: id.clone(),
            name: id.to_string(),
            direction,
        };
        let device = self.device(&probe)?;
        Ok(Self::endpoint(&device, direction))
    }
}

impl AudioBackend for CpalBackend {
    fn mix_format(&self, endpoint: &Endpoint) -> Option<PcmFormat> {
        let device = self.device(endpoint).ok()?;
        let config = device.default_output_config().ok()?;
        pcm_format(config.sample_format(), config.sample_rate())
    }

    fn open_capture(
        &self,
        request: &CaptureRequest,
        on_data: CaptureCallback,
    ) -> Result<Box<dyn CaptureHandle>, NativeError> {
        // Loopback capture is an input stream opened on an output device
        let lookup = Endpoint {
            direction: if request.loopback {
                Direction::Render
            } else {
                Direction::Capture
            },
            ..request.endpoint.clone()
        };
        let device = self.device(&lookup)?;
        let supported = Self::capture_config(&device, request.loopback, request.format)?;

        let format = pcm_format(supported.sample_format(), supported.sample_rate()).ok_or_else(|| {
            NativeError::new(
                NativeErrorKind::FormatRejected,
                format!("unsupported capture sample format {:?}", supported.sample_format()),
            )
        })?;
        let config: cpal::StreamConfig = supported.config();

        debug!(
            device = %request.endpoint.name,
            loopback = request.loopback,
            device_channels = config.channels,
            format = %format,
            "opening capture stream"
        );

        let stream = match supported.sample_format() {
            cpal::SampleFormat::I16 => build_capture_stream::<i16>(&device, &config, format, on_data)?,
            cpal::SampleFormat::I32 => build_capture_stream::<i32>(&device, &config, format, on_data)?,
            _ => build_capture_stream::<f32>(&device, &config, format, on_data)?,
        };

        Ok(Box::new(CpalCapture {
            stream: Some(stream),
            format,
        }))
    }

    fn open_render_client(&self, endpoint: &Endpoint) -> Result<Box<dyn NativeRenderClient>, NativeError> {
        let device = self.device(endpoint)?;
        Ok(Box::new(CpalRenderClient::new(device)))
    }
}

/// Build an input stream delivering interleaved stereo bytes in `format`
fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: PcmFormat,
    mut on_data: CaptureCallback,
) -> Result<cpal::Stream, NativeError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let layout = SampleLayout::of(&format)
        .ok_or_else(|| NativeError::new(NativeErrorKind::FormatRejected, format!("unsupported format {format}")))?;
    let mut samples: Vec<f32> = Vec::with_capacity(4096);
    let mut bytes: Vec<u8> = Vec::with_capacity(4096 * layout.bytes());

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                samples.clear();
                for frame in data.chunks_exact(channels) {
                    let left = f32::from_sample(frame[0]);
                    let right = frame.get(1).map_or(left, |s| f32::from_sample(*s));
                    samples.push(left);
                    samples.push(right);
                }
                bytes.clear();
                layout.encode(&samples, &mut bytes);
                on_data(&bytes);
            },
            |err| error!(error = %err, "capture stream error"),
            None,
        )
        .map_err(build_error)
}

struct CpalCapture {
    stream: Option<cpal::Stream>,
    format: PcmFormat,
}

impl CaptureHandle for CpalCapture {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), NativeError> {
        match &self.stream {
            Some(stream) => stream
                .play()
                .map_err(|e| native(NativeErrorKind::Other, "failed to start capture", e)),
            None => Err(NativeError::new(NativeErrorKind::Other, "capture already stopped")),
        }
    }

    fn stop(&mut self) -> Result<(), NativeError> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|e| native(NativeErrorKind::Other, "failed to pause capture", e))?;
        }
        Ok(())
    }
}

/// Shared-mode render client emulated over a CPAL output stream
struct CpalRenderClient {
    device: cpal::Device,
    format: Option<PcmFormat>,
    ring: Option<Arc<ByteQueue>>,
    stream: Option<cpal::Stream>,
    buffer_frames: u32,
    staging: Vec<u8>,
    events: Option<Receiver<()>>,
    invalidated: Arc<AtomicBool>,
}

impl CpalRenderClient {
    fn new(device: cpal::Device) -> Self {
        Self {
            device,
            format: None,
            ring: None,
            stream: None,
            buffer_frames: 0,
            staging: Vec::new(),
            events: None,
            invalidated: Arc::new(AtomicBool::new(false)),
        }
    }

    fn initialized(&self) -> Result<(PcmFormat, &Arc<ByteQueue>), NativeError> {
        match (self.format, self.ring.as_ref()) {
            (Some(format), Some(ring)) => Ok((format, ring)),
            _ => Err(NativeError::new(NativeErrorKind::Other, "client not initialized")),
        }
    }

    fn check_device(&self) -> Result<(), NativeError> {
        if self.invalidated.load(Ordering::Acquire) {
            return Err(NativeError::new(
                NativeErrorKind::DeviceInvalidated,
                "output stream reported an error",
            ));
        }
        Ok(())
    }
}

impl NativeRenderClient for CpalRenderClient {
    fn set_raw_processing(&mut self, _enabled: bool) -> Result<(), NativeError> {
        Err(NativeError::new(
            NativeErrorKind::Unsupported,
            "RAW processing is not exposed by this backend",
        ))
    }

    fn initialize(
        &mut self,
        format: &PcmFormat,
        share_mode: ShareMode,
        buffer_duration: Duration,
        _sync: SyncMode,
    ) -> Result<(), NativeError> {
        if share_mode == ShareMode::Exclusive {
            return Err(NativeError::new(
                NativeErrorKind::ExclusiveUnsupported,
                "exclusive mode is not available through this backend",
            ));
        }
        let layout = SampleLayout::of(format)
            .ok_or_else(|| NativeError::new(NativeErrorKind::FormatRejected, format!("unsupported format {format}")))?;

        let device_config = self
            .device
            .default_output_config()
            .map_err(|e| native(NativeErrorKind::DeviceInvalidated, "no default output format", e))?;
        let config = cpal::StreamConfig {
            channels: device_config.channels(),
            sample_rate: format.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let frames = format.frames_for(buffer_duration).max(1);
        let ring = Arc::new(ByteQueue::with_capacity(
            format.frames_to_bytes(frames),
            format.block_align(),
        ));
        let (event_tx, event_rx) = channel::bounded(1);

        let feed = RenderFeed {
            ring: Arc::clone(&ring),
            layout,
            block_align: format.block_align(),
            device_channels: usize::from(config.channels.max(1)),
            bytes: Vec::new(),
            samples: Vec::new(),
            event: event_tx,
        };
        let invalidated = Arc::clone(&self.invalidated);
        let on_error = move |err: cpal::StreamError| {
            error!(error = %err, "render stream error");
            invalidated.store(true, Ordering::Release);
        };

        let stream = match device_config.sample_format() {
            cpal::SampleFormat::I16 => build_render_stream::<i16>(&self.device, &config, feed, on_error)?,
            cpal::SampleFormat::I32 => build_render_stream::<i32>(&self.device, &config, feed, on_error)?,
            _ => build_render_stream::<f32>(&self.device, &config, feed, on_error)?,
        };

        debug!(
            format = %format,
            device_channels = config.channels,
            buffer_frames = frames,
            "cpal render client initialized"
        );

        self.format = Some(*format);
        self.buffer_frames = frames as u32;
        self.staging = vec![0; format.frames_to_bytes(frames)];
        self.ring = Some(ring);
        self.events = Some(event_rx);
        self.stream = Some(stream);
        Ok(())
    }

    fn buffer_size(&self) -> Result<u32, NativeError> {
        self.initialized()?;
        Ok(self.buffer_frames)
    }

    fn current_padding(&self) -> Result<u32, NativeError> {
        self.check_device()?;
        let (format, ring) = self.initialized()?;
        Ok(format.bytes_to_frames(ring.len()) as u32)
    }

    fn wait(&mut self, timeout: Duration) -> Result<WaitOutcome, NativeError> {
        self.check_device()?;
        let Some(events) = self.events.as_ref() else {
            return Err(NativeError::new(NativeErrorKind::Other, "client not initialized"));
        };
        match events.recv_timeout(timeout) {
            Ok(()) => Ok(WaitOutcome::Ready),
            Err(RecvTimeoutError::Timeout) => Ok(WaitOutcome::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(NativeError::new(
                NativeErrorKind::DeviceInvalidated,
                "render stream closed",
            )),
        }
    }

    fn get_buffer(&mut self, frames: u32) -> Result<&mut [u8], NativeError> {
        let (format, _) = self.initialized()?;
        if frames > self.buffer_frames {
            return Err(NativeError::new(
                NativeErrorKind::Other,
                format!("requested {frames} frames from a {}-frame buffer", self.buffer_frames),
            ));
        }
        let bytes = format.frames_to_bytes(frames as usize);
        Ok(&mut self.staging[..bytes])
    }

    fn release_buffer(&mut self, frames: u32) -> Result<(), NativeError> {
        let (format, ring) = self.initialized()?;
        let bytes = format.frames_to_bytes(frames as usize);
        ring.push(&self.staging[..bytes]);
        Ok(())
    }

    fn start(&mut self) -> Result<(), NativeError> {
        match &self.stream {
            Some(stream) => stream
                .play()
                .map_err(|e| native(NativeErrorKind::Other, "failed to start render stream", e)),
            None => Err(NativeError::new(NativeErrorKind::Other, "client not initialized")),
        }
    }

    fn stop(&mut self) -> Result<(), NativeError> {
        if let Some(stream) = &self.stream {
            stream
                .pause()
                .map_err(|e| native(NativeErrorKind::Other, "failed to pause render stream", e))?;
        }
        Ok(())
    }
}

/// State moved into the CPAL output callback
struct RenderFeed {
    ring: Arc<ByteQueue>,
    layout: SampleLayout,
    block_align: usize,
    device_channels: usize,
    bytes: Vec<u8>,
    samples: Vec<f32>,
    event: Sender<()>,
}

impl RenderFeed {
    fn fill<T>(&mut self, data: &mut [T])
    where
        T: SizedSample + FromSample<f32>,
    {
        let frames = data.len() / self.device_channels;
        self.bytes.resize(frames * self.block_align, 0);
        let read = self.ring.pull(&mut self.bytes);

        self.samples.clear();
        self.layout.decode(&self.bytes[..read], &mut self.samples);

        let channels = usize::from(CHANNEL_COUNT);
        for (frame, out) in data.chunks_exact_mut(self.device_channels).enumerate() {
            let source = self.samples.get(frame * channels..frame * channels + channels);
            match (source, out.len()) {
                (Some(stereo), 1) => out[0] = T::from_sample((stereo[0] + stereo[1]) * 0.5),
                (Some(stereo), _) => {
                    out[0] = T::from_sample(stereo[0]);
                    out[1] = T::from_sample(stereo[1]);
                    for extra in &mut out[2..] {
                        *extra = T::EQUILIBRIUM;
                    }
                }
                // Starved: silence
                (None, _) => out.fill(T::EQUILIBRIUM),
            }
        }

        let _ = self.event.try_send(());
    }
}

fn build_render_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut feed: RenderFeed,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, NativeError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| feed.fill(data),
            on_error,
            None,
        )
        .map_err(build_error)
}
