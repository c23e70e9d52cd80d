//! Error types for the mirroring pipeline
//!
//! Startup failures are fatal to a single `start()` call and always name the
//! side of the pipeline they came from. Runtime under-runs are not errors;
//! they are counted and surfaced through the status snapshot.

use crate::domain::device::ChannelId;
use crate::domain::format::PcmFormat;
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

/// Side of the pipeline an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Capture,
    Channel(ChannelId),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Capture => f.write_str("capture"),
            Stage::Channel(channel) => write!(f, "{channel} channel"),
        }
    }
}

impl From<ChannelId> for Stage {
    fn from(channel: ChannelId) -> Self {
        Stage::Channel(channel)
    }
}

/// Coarse classification of [`MirrorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FormatMismatch,
    DeviceUnavailable,
    NativeInitFailure,
    InvalidConfiguration,
    AlreadyRunning,
}

/// Errors surfaced by engine startup
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Source and forced target formats differ and conversion is not allowed
    #[error("{channel} channel: source format {source_format} does not match target format {target} and implicit conversion is disabled")]
    FormatMismatch {
        channel: ChannelId,
        source_format: PcmFormat,
        target: PcmFormat,
    },

    /// Device not found, or exclusive access denied or already held
    #[error("{stage}: device '{device}' unavailable: {reason}")]
    DeviceUnavailable {
        stage: Stage,
        device: String,
        reason: String,
    },

    /// The platform rejected an otherwise valid-looking request
    #[error("{stage}: native initialization failed (code {}): {detail}", hex_code(.code))]
    NativeInitFailure { stage: Stage, code: i64, detail: String },

    #[error("{stage}: invalid configuration: {detail}")]
    InvalidConfiguration { stage: Stage, detail: String },

    /// `start()` was called on a running engine
    #[error("engine is already running; stop it before starting again")]
    AlreadyRunning,
}

impl MirrorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MirrorError::FormatMismatch { .. } => ErrorKind::FormatMismatch,
            MirrorError::DeviceUnavailable { .. } => ErrorKind::DeviceUnavailable,
            MirrorError::NativeInitFailure { .. } => ErrorKind::NativeInitFailure,
            MirrorError::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            MirrorError::AlreadyRunning => ErrorKind::AlreadyRunning,
        }
    }

    /// Output channel the error is attributed to, if any
    pub fn channel(&self) -> Option<ChannelId> {
        let stage = match self {
            MirrorError::FormatMismatch { channel, .. } => return Some(*channel),
            MirrorError::DeviceUnavailable { stage, .. }
            | MirrorError::NativeInitFailure { stage, .. }
            | MirrorError::InvalidConfiguration { stage, .. } => *stage,
            MirrorError::AlreadyRunning => return None,
        };
        match stage {
            Stage::Channel(channel) => Some(channel),
            Stage::Capture => None,
        }
    }

    pub fn invalid(stage: impl Into<Stage>, detail: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Classify a platform failure for `stage` on `device`
    pub fn from_native(stage: impl Into<Stage>, device: impl Into<String>, err: NativeError) -> Self {
        let stage = stage.into();
        match err.kind {
            NativeErrorKind::DeviceNotFound
            | NativeErrorKind::DeviceBusy
            | NativeErrorKind::AccessDenied
            | NativeErrorKind::ExclusiveUnsupported => Self::DeviceUnavailable {
                stage,
                device: device.into(),
                reason: err.to_string(),
            },
            _ => Self::NativeInitFailure {
                stage,
                code: err.code.unwrap_or(0),
                detail: err.message,
            },
        }
    }
}

/// What went wrong inside a platform call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeErrorKind {
    DeviceNotFound,
    /// The device is in use, typically by another exclusive-mode client
    DeviceBusy,
    AccessDenied,
    FormatRejected,
    ExclusiveUnsupported,
    /// The device disappeared or was reconfigured while in use
    DeviceInvalidated,
    /// The backend does not implement the request
    Unsupported,
    Other,
}

/// A failure reported by a platform audio API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}{}", .code.as_ref().map(|c| format!(" (code {})", hex_code(c))).unwrap_or_default())]
pub struct NativeError {
    pub kind: NativeErrorKind,
    /// Platform status code, when the platform provides one
    pub code: Option<i64>,
    pub message: String,
}

impl NativeError {
    pub fn new(kind: NativeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }
}

/// Status codes are 32-bit on every supported platform; negative values are
/// shown as their unsigned bit pattern (`0x8889000a`, not `0xffffffff8889000a`)
fn hex_code<C: Borrow<i64>>(code: C) -> String {
    let code = *code.borrow();
    match i32::try_from(code) {
        Ok(narrow) => format!("{:#010x}", narrow as u32),
        Err(_) => match u32::try_from(code) {
            Ok(unsigned) => format!("{unsigned:#010x}"),
            Err(_) => format!("{code:#x}"),
        },
    }
}
