//! Domain entities and business rules

pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod negotiation;
pub mod status;

// Re-export specific items to avoid ambiguous glob imports
pub use config::{
    BufferAlignment, ChannelConfig, ConversionPolicy, EngineConfig, InputFormatStrategy,
    InputSelection, ResamplerQuality, SharePreference, SyncPreference,
};
pub use device::{
    AudioBackend, CaptureCallback, CaptureHandle, CaptureRequest, ChannelId, DeviceDirectory,
    DeviceId, Direction, Endpoint, NativeRenderClient, ShareMode, SyncMode, WaitOutcome,
};
pub use error::{ErrorKind, MirrorError, NativeError, NativeErrorKind, Result, Stage};
pub use format::{PcmFormat, SampleEncoding, CHANNEL_COUNT};
pub use negotiation::{effective_buffer_duration, ChannelPlan, FormatNegotiator, ResamplerPlan};
pub use status::{ChannelRuntimeState, ChannelStatus, PumpCounters, StatusReporter, StatusSnapshot};
