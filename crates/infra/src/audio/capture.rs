//! Capture side of the pipeline
//!
//! Opens either a loopback capture of the default render endpoint or an
//! explicit input endpoint, and feeds every delivered block into the fan-out.

use super::fanout::FanoutBuffer;
use audiomirror_core::{
    AudioBackend, CaptureHandle, CaptureRequest, Direction, Endpoint, InputFormatStrategy,
    InputSelection, MirrorError, PcmFormat, Result, Stage, CHANNEL_COUNT,
};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// A running capture stream and the fan-out it feeds
pub struct CaptureSource {
    handle: Option<Box<dyn CaptureHandle>>,
    endpoint: Endpoint,
    format: PcmFormat,
    fanout: Arc<FanoutBuffer>,
}

impl CaptureSource {
    /// Open and start capture
    ///
    /// The fan-out is sized from the format the device actually delivers,
    /// which may differ from the one requested.
    pub fn open(
        backend: &dyn AudioBackend,
        input: &InputSelection,
        strategy: InputFormatStrategy,
        capacity: usize,
    ) -> Result<Self> {
        let (endpoint, loopback) = match input {
            InputSelection::Loopback => (backend.resolve(Direction::Render, None), true),
            InputSelection::Device(id) => (backend.resolve(Direction::Capture, Some(id)), false),
        };
        let endpoint = endpoint.map_err(|e| {
            let device = match input {
                InputSelection::Loopback => "default render endpoint".to_string(),
                InputSelection::Device(id) => id.to_string(),
            };
            MirrorError::from_native(Stage::Capture, device, e)
        })?;

        // The callback starts forwarding once the fan-out exists
        let slot: Arc<OnceLock<Arc<FanoutBuffer>>> = Arc::new(OnceLock::new());
        let callback_slot = Arc::clone(&slot);
        let request = CaptureRequest {
            endpoint: endpoint.clone(),
            loopback,
            format: strategy,
        };

        let mut handle = backend
            .open_capture(
                &request,
                Box::new(move |bytes: &[u8]| {
                    if let Some(fanout) = callback_slot.get() {
                        fanout.push(bytes);
                    }
                }),
            )
            .map_err(|e| MirrorError::from_native(Stage::Capture, endpoint.name.clone(), e))?;

        let format = handle.format();
        if format.channels != CHANNEL_COUNT || format.block_align() == 0 {
            let _ = handle.stop();
            return Err(MirrorError::invalid(
                Stage::Capture,
                format!("capture delivers {format}, expected interleaved stereo"),
            ));
        }

        if let InputFormatStrategy::Custom {
            sample_rate,
            bit_depth,
        } = strategy
        {
            let requested = PcmFormat::int(sample_rate, bit_depth);
            if format != requested {
                warn!(
                    requested = %requested,
                    actual = %format,
                    "custom capture format not honoured; using the device format"
                );
            }
        }

        let fanout = Arc::new(FanoutBuffer::new(capacity, format.block_align()));
        let _ = slot.set(Arc::clone(&fanout));

        if let Err(e) = handle.start() {
            let _ = handle.stop();
            return Err(MirrorError::from_native(Stage::Capture, endpoint.name.clone(), e));
        }

        info!(
            device = %endpoint.name,
            loopback,
            format = %format,
            "capture started"
        );

        Ok(Self {
            handle: Some(handle),
            endpoint,
            format,
            fanout,
        })
    }

    /// Format delivered into the fan-out
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn fanout(&self) -> Arc<FanoutBuffer> {
        Arc::clone(&self.fanout)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop delivery and release the capture handle. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.stop() {
                warn!(device = %self.endpoint.name, error = %e, "failed to stop capture");
            }
            drop(handle);
            info!(device = %self.endpoint.name, "capture stopped");
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}
