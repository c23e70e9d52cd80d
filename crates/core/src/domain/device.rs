//! Audio device abstractions
//!
//! This module defines the platform-agnostic device interfaces the pipeline
//! is written against. Implementations for specific platforms live in the
//! `infra` crate. Raw pointers and platform handles never leave those
//! implementations.

use crate::domain::config::InputFormatStrategy;
use crate::domain::error::NativeError;
use crate::domain::format::PcmFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One of the two mirrored outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelId {
    Main,
    Aux,
}

impl ChannelId {
    /// Start order; teardown runs in reverse
    pub const ALL: [ChannelId; 2] = [ChannelId::Main, ChannelId::Aux];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelId::Main => "main",
            ChannelId::Aux => "aux",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ChannelId::Main => 0,
            ChannelId::Aux => 1,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identifier for an audio endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty identifiers stand for the system default endpoint
    pub fn is_default(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Render,
    Capture,
}

/// A resolved endpoint handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: DeviceId,
    pub name: String,
    pub direction: Direction,
}

/// Device access mode actually requested from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareMode {
    Exclusive,
    Shared,
}

impl fmt::Display for ShareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareMode::Exclusive => f.write_str("exclusive"),
            ShareMode::Shared => f.write_str("shared"),
        }
    }
}

/// How the render loop learns that the device wants more data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Block on a device-signalled event
    Event,
    /// Sleep for a fraction of the buffer period
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

/// Resolves device identifiers to endpoints
pub trait DeviceDirectory {
    /// The system default endpoint for `direction`
    fn default_endpoint(&self, direction: Direction) -> Result<Endpoint, NativeError>;

    /// The endpoint with exactly this identifier
    fn find_endpoint(&self, direction: Direction, id: &DeviceId) -> Result<Endpoint, NativeError>;

    /// Resolve an optional identifier; `None` and empty ids mean "default"
    fn resolve(&self, direction: Direction, id: Option<&DeviceId>) -> Result<Endpoint, NativeError> {
        match id {
            Some(id) if !id.is_default() => self.find_endpoint(direction, id),
            _ => self.default_endpoint(direction),
        }
    }
}

/// Low-level render client, modelled on a hardware ring buffer
///
/// A client is opened, used and released on a single pump thread, so
/// implementations are not required to be `Send`.
pub trait NativeRenderClient {
    /// Request that platform audio processing be bypassed. Must be called
    /// before [`initialize`](Self::initialize).
    fn set_raw_processing(&mut self, enabled: bool) -> Result<(), NativeError>;

    fn initialize(
        &mut self,
        format: &PcmFormat,
        share_mode: ShareMode,
        buffer_duration: Duration,
        sync: SyncMode,
    ) -> Result<(), NativeError>;

    /// Hardware buffer size in frames
    fn buffer_size(&self) -> Result<u32, NativeError>;

    /// Frames queued in the hardware buffer and not yet played
    fn current_padding(&self) -> Result<u32, NativeError>;

    /// Wait for the device event registered at initialization
    fn wait(&mut self, timeout: Duration) -> Result<WaitOutcome, NativeError>;

    /// Writable span for exactly `frames` frames
    fn get_buffer(&mut self, frames: u32) -> Result<&mut [u8], NativeError>;

    /// Commit `frames` frames written into the span from [`get_buffer`](Self::get_buffer)
    fn release_buffer(&mut self, frames: u32) -> Result<(), NativeError>;

    fn start(&mut self) -> Result<(), NativeError>;

    fn stop(&mut self) -> Result<(), NativeError>;
}

/// Receives interleaved stereo PCM blocks on the capture delivery thread.
/// Must not block.
pub type CaptureCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Parameters for opening a capture stream
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub endpoint: Endpoint,
    /// Capture what `endpoint` (a render endpoint) is playing
    pub loopback: bool,
    pub format: InputFormatStrategy,
}

/// An opened capture stream
pub trait CaptureHandle {
    /// Format actually delivered to the callback, which may differ from the
    /// requested one
    fn format(&self) -> PcmFormat;

    fn start(&mut self) -> Result<(), NativeError>;

    /// Stop delivery. Safe to call more than once.
    fn stop(&mut self) -> Result<(), NativeError>;
}

/// Everything the pipeline needs from a platform audio API
pub trait AudioBackend: DeviceDirectory + Send + Sync {
    /// Current shared-mode mix format of a render endpoint, if the platform
    /// reports one
    fn mix_format(&self, endpoint: &Endpoint) -> Option<PcmFormat>;

    fn open_capture(
        &self,
        request: &CaptureRequest,
        on_data: CaptureCallback,
    ) -> Result<Box<dyn CaptureHandle>, NativeError>;

    /// Called on the pump thread that will own the client
    fn open_render_client(&self, endpoint: &Endpoint) -> Result<Box<dyn NativeRenderClient>, NativeError>;
}
