//! Audio pipeline and backend implementations
//!
//! The real-time pipeline (capture, fan-out, resampling, render pumps) is
//! backend-agnostic. Two backends implement the device traits:
//! - [`CpalBackend`]: WASAPI, ALSA/PulseAudio and CoreAudio through CPAL
//! - [`FakeBackend`]: deterministic in-memory devices for tests and dry runs

pub mod capture;
pub mod cpal_backend;
pub mod engine;
pub mod fake;
pub mod fanout;
pub mod pcm;
pub mod realtime;
pub mod render_pump;
pub mod resampler;

pub use capture::CaptureSource;
pub use cpal_backend::CpalBackend;
pub use engine::MirrorEngine;
pub use fake::{FakeBackend, RecordedInit};
pub use fanout::{ByteQueue, FanoutBuffer, DEFAULT_FANOUT_CAPACITY};
pub use pcm::{PcmSource, QueueSource, SampleLayout};
pub use realtime::{enable_realtime_audio_thread, RealtimeThreadGuard};
pub use render_pump::{PumpState, RenderPump, RenderSettings};
pub use resampler::{ResampleError, ResamplingStage};
