//! Integration tests for the data path
//!
//! Captured bytes are injected through the fake backend and checked where
//! they land: the fan-out queues, the resampler and the rendered output of
//! each device.

use audiomirror_core::{
    BufferAlignment, ChannelId, ConversionPolicy, DeviceId, EngineConfig, ErrorKind,
    InputFormatStrategy, InputSelection, PcmFormat, SharePreference, SyncMode, SyncPreference,
};
use audiomirror_infra::{FakeBackend, FanoutBuffer, MirrorEngine, PcmSource, QueueSource};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn two_device_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.main.device_id = Some(DeviceId::new("speakers"));
    config.aux.device_id = Some(DeviceId::new("spdif"));
    config
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Interleaved stereo 16-bit sine, as little-endian bytes
fn sine_bytes(frames: usize, frequency: f32, sample_rate: u32) -> Vec<u8> {
    (0..frames)
        .flat_map(|i| {
            let phase = 2.0 * std::f32::consts::PI * frequency * i as f32 / sample_rate as f32;
            let sample = (phase.sin() * 0.5 * i16::MAX as f32) as i16;
            let bytes = sample.to_le_bytes();
            [bytes[0], bytes[1], bytes[0], bytes[1]]
        })
        .collect()
}

// ============================================================================
// FAN-OUT FIDELITY
// ============================================================================

#[test]
fn test_both_outputs_receive_identical_bytes() {
    let backend = FakeBackend::new();
    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), two_device_config());
    engine.start().unwrap();

    let mut expected = Vec::new();
    for block in 0..50usize {
        let frames = 16 + (block * 37) % 240;
        let bytes: Vec<u8> = (0..frames * 4).map(|i| (i + block * 7) as u8).collect();
        assert!(backend.inject_capture(&bytes));
        expected.extend_from_slice(&bytes);
    }

    assert!(wait_for(|| backend.rendered_bytes("speakers").len() == expected.len()));
    assert!(wait_for(|| backend.rendered_bytes("spdif").len() == expected.len()));
    assert_eq!(backend.rendered_bytes("speakers"), expected);
    assert_eq!(backend.rendered_bytes("spdif"), expected);

    let status = engine.status_snapshot();
    let frames = (expected.len() / 4) as u64;
    assert_eq!(status.main.frames_rendered, frames);
    assert_eq!(status.aux.frames_rendered, frames);
}

#[test]
fn test_starved_channels_count_underruns() {
    let backend = FakeBackend::new();
    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), two_device_config());
    engine.start().unwrap();

    assert!(wait_for(|| {
        let status = engine.status_snapshot();
        status.main.underruns > 0 && status.aux.underruns > 0
    }));
    // Starvation writes nothing rather than stale data
    assert!(backend.rendered_bytes("speakers").is_empty());
    assert!(engine.status_snapshot().main.running);
}

#[test]
fn test_resampled_channel_renders_converted_stream() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.conversion = ConversionPolicy::Flexible;
    config.aux.share_mode = SharePreference::Exclusive;
    config.aux.sample_rate = 96000;
    config.aux.bit_depth = 16;

    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), config);
    engine.start().unwrap();

    // 100 ms at 48 kHz
    let input = sine_bytes(4800, 1000.0, 48000);
    for block in input.chunks(480 * 4) {
        assert!(backend.inject_capture(block));
    }

    // Main is untouched, aux carries roughly twice the frames
    assert!(wait_for(|| backend.rendered_bytes("speakers").len() == input.len()));
    assert_eq!(backend.rendered_bytes("speakers"), input);

    assert!(wait_for(|| backend.rendered_bytes("spdif").len() >= 9000 * 4));
    let aux = backend.rendered_bytes("spdif");
    assert_eq!(aux.len() % 4, 0);
    assert!(aux.len() <= 9600 * 4);

    // The converted signal is not silence
    let peak = aux
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]).unsigned_abs())
        .max()
        .unwrap_or(0);
    assert!(peak > 8000, "peak was {peak}");
}

proptest! {
    #[test]
    fn prop_consumers_see_same_order(
        blocks in prop::collection::vec(1usize..64, 1..40),
        main_pull in 1usize..100,
        aux_pull in 1usize..100,
    ) {
        let format = PcmFormat::int(48000, 16);
        let fanout = Arc::new(FanoutBuffer::new(64 * 1024, format.block_align()));
        let mut main = QueueSource::new(Arc::clone(&fanout), ChannelId::Main, format);
        let mut aux = QueueSource::new(Arc::clone(&fanout), ChannelId::Aux, format);

        let mut expected = Vec::new();
        for (n, frames) in blocks.iter().enumerate() {
            let bytes: Vec<u8> = (0..frames * 4).map(|i| (i * 31 + n) as u8).collect();
            fanout.push(&bytes);
            expected.extend_from_slice(&bytes);
        }

        let drain = |source: &mut QueueSource, frames: usize| {
            let mut out = Vec::new();
            let mut chunk = vec![0u8; frames * 4];
            loop {
                let read = source.read(&mut chunk);
                if read == 0 {
                    break out;
                }
                out.extend_from_slice(&chunk[..read]);
            }
        };

        prop_assert_eq!(drain(&mut main, main_pull), expected.clone());
        prop_assert_eq!(drain(&mut aux, aux_pull), expected);
    }
}

// ============================================================================
// CAPTURE SELECTION
// ============================================================================

#[test]
fn test_explicit_input_with_custom_format() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.input = InputSelection::Device(DeviceId::new("line-in"));
    config.input_format = InputFormatStrategy::Custom {
        sample_rate: 44100,
        bit_depth: 24,
    };

    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), config);
    engine.start().unwrap();

    assert_eq!(engine.capture_format(), Some(PcmFormat::int(44100, 24)));
    // Shared channels without a resampler feed the capture format through
    for init in backend.initializations() {
        assert_eq!(init.format, PcmFormat::int(44100, 24));
    }
}

#[test]
fn test_ignored_custom_format_uses_actual_format() {
    let backend = FakeBackend::new().ignoring_custom_format();
    let mut config = two_device_config();
    config.input_format = InputFormatStrategy::Custom {
        sample_rate: 96000,
        bit_depth: 32,
    };

    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), config);
    engine.start().unwrap();

    assert_eq!(engine.capture_format(), Some(PcmFormat::int(48000, 16)));
    for init in backend.initializations() {
        assert_eq!(init.format, PcmFormat::int(48000, 16));
    }
}

#[test]
fn test_prefer_float_capture() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.input_format = InputFormatStrategy::PreferFloat32;

    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), config);
    engine.start().unwrap();

    let format = engine.capture_format().unwrap();
    assert!(format.is_identical(&PcmFormat::float32(48000)));
}

#[test]
fn test_unknown_input_device() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.input = InputSelection::Device(DeviceId::new("usb-mic"));

    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), config);
    let err = engine.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    assert_eq!(err.channel(), None);
    assert_eq!(backend.open_handles(), 0);
}

// ============================================================================
// DEVICE SETTINGS
// ============================================================================

#[test]
fn test_buffer_alignment_reaches_device() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.main.buffer_ms = 3;
    config.main.alignment = BufferAlignment::Minimum;
    config.aux.buffer_ms = 3;
    config.aux.alignment = BufferAlignment::Default;

    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), config);
    engine.start().unwrap();

    let inits = backend.initializations();
    let main = inits.iter().find(|i| i.device.as_str() == "speakers").unwrap();
    let aux = inits.iter().find(|i| i.device.as_str() == "spdif").unwrap();
    assert!(main.buffer_duration >= Duration::from_millis(12));
    assert_eq!(aux.buffer_duration, Duration::from_millis(3));
}

#[test]
fn test_oversized_buffer_is_clamped() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.main.buffer_ms = 60_000;

    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), config);
    engine.start().unwrap();

    let inits = backend.initializations();
    let main = inits.iter().find(|i| i.device.as_str() == "speakers").unwrap();
    assert_eq!(main.buffer_duration, Duration::from_secs(1));
}

#[test]
fn test_polling_channel_renders() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.aux.sync_mode = SyncPreference::Polling;

    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), config);
    engine.start().unwrap();

    let inits = backend.initializations();
    let aux = inits.iter().find(|i| i.device.as_str() == "spdif").unwrap();
    assert_eq!(aux.sync_mode, SyncMode::Polling);

    let block = vec![7u8; 480 * 4];
    assert!(backend.inject_capture(&block));
    assert!(wait_for(|| backend.rendered_bytes("spdif") == block));
}

#[test]
fn test_raw_flag_reaches_device() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.main.raw_mode = true;

    let mut engine = MirrorEngine::new(Arc::new(backend.clone()), config);
    engine.start().unwrap();

    for init in backend.initializations() {
        assert_eq!(init.raw, init.device.as_str() == "speakers");
    }
}
