//! Integration tests for engine startup, rollback and status
//!
//! These tests drive `MirrorEngine` end to end and check the device-level
//! effects through the fake backend's counters.

use audiomirror_core::{
    ChannelId, ConversionPolicy, DeviceId, EngineConfig, ErrorKind, MirrorError, NativeError,
    NativeErrorKind, PcmFormat, ShareMode, SharePreference,
};
use audiomirror_infra::{FakeBackend, MirrorEngine};
use std::sync::Arc;

fn two_device_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.main.device_id = Some(DeviceId::new("speakers"));
    config.aux.device_id = Some(DeviceId::new("spdif"));
    config
}

fn engine_with(backend: &FakeBackend, config: EngineConfig) -> MirrorEngine {
    MirrorEngine::new(Arc::new(backend.clone()), config)
}

// ============================================================================
// FORMAT NEGOTIATION AT STARTUP
// ============================================================================

#[test]
fn test_forced_exclusive_mismatch_opens_no_device() {
    // Capture 48000/16, aux forced to exclusive 192000/24
    let backend = FakeBackend::new().with_capture_format(PcmFormat::int(48000, 16));
    let mut config = two_device_config();
    config.aux.share_mode = SharePreference::Exclusive;
    config.aux.forced_format = true;
    config.aux.sample_rate = 192000;
    config.aux.bit_depth = 24;

    let mut engine = engine_with(&backend, config);
    let err = engine.start().unwrap_err();

    match &err {
        MirrorError::FormatMismatch {
            channel,
            source_format,
            target,
        } => {
            assert_eq!(*channel, ChannelId::Aux);
            assert_eq!(*source_format, PcmFormat::int(48000, 16));
            assert_eq!(*target, PcmFormat::int(192000, 24));
        }
        other => panic!("expected FormatMismatch, got {other:?}"),
    }

    let message = err.to_string();
    assert!(message.contains("aux"));
    assert!(message.contains("192000"));
    assert!(message.contains("48000"));

    assert_eq!(backend.render_clients_opened(), 0);
    assert_eq!(backend.open_handles(), 0);
    assert!(!engine.is_running());
}

#[test]
fn test_forced_format_overrides_flexible_policy() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.conversion = ConversionPolicy::Flexible;
    config.main.share_mode = SharePreference::Exclusive;
    config.main.forced_format = true;
    config.main.sample_rate = 96000;

    let mut engine = engine_with(&backend, config);
    let err = engine.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FormatMismatch);
    assert_eq!(err.channel(), Some(ChannelId::Main));
    assert_eq!(backend.render_clients_opened(), 0);
}

#[test]
fn test_flexible_exclusive_mismatch_resamples() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.conversion = ConversionPolicy::Flexible;
    config.aux.share_mode = SharePreference::Exclusive;
    config.aux.sample_rate = 96000;
    config.aux.bit_depth = 24;

    let mut engine = engine_with(&backend, config);
    engine.start().unwrap();

    let status = engine.status_snapshot();
    assert!(status.aux.internal_resampler);
    assert!(!status.aux.multi_stage_src);
    assert!(!status.main.internal_resampler);

    let inits = backend.initializations();
    let aux = inits.iter().find(|i| i.device.as_str() == "spdif").unwrap();
    assert_eq!(aux.share_mode, ShareMode::Exclusive);
    assert_eq!(aux.format, PcmFormat::int(96000, 24));
}

#[test]
fn test_exclusive_matching_format_needs_no_conversion() {
    let backend = FakeBackend::new();
    let mut config = two_device_config();
    config.main.exclusive = true;
    config.main.bit_depth = 16;

    let mut engine = engine_with(&backend, config);
    engine.start().unwrap();

    let inits = backend.initializations();
    let main = inits.iter().find(|i| i.device.as_str() == "speakers").unwrap();
    assert_eq!(main.share_mode, ShareMode::Exclusive);
    assert_eq!(main.format, PcmFormat::int(48000, 16));
    assert!(!engine.status_snapshot().main.internal_resampler);
}

// ============================================================================
// ALL-OR-NOTHING STARTUP
// ============================================================================

#[test]
fn test_aux_init_failure_leaves_nothing_open() {
    let backend = FakeBackend::new().failing_initialize(
        "spdif",
        NativeError::new(NativeErrorKind::FormatRejected, "unsupported format").with_code(0x8889_0008),
    );
    let mut engine = engine_with(&backend, two_device_config());

    let err = engine.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NativeInitFailure);
    assert_eq!(err.channel(), Some(ChannelId::Aux));
    match err {
        MirrorError::NativeInitFailure { code, .. } => assert_eq!(code, 0x8889_0008),
        other => panic!("expected NativeInitFailure, got {other:?}"),
    }

    // Main had been initialized and started before aux failed
    assert_eq!(backend.render_clients_opened(), 2);
    assert_eq!(backend.open_handles(), 0);
    assert!(!backend.is_capturing());

    let status = engine.status_snapshot();
    assert!(!status.main.running);
    assert!(!status.aux.running);
}

#[test]
fn test_aux_start_failure_leaves_nothing_open() {
    let backend = FakeBackend::new().failing_start(
        "spdif",
        NativeError::new(NativeErrorKind::DeviceInvalidated, "unplugged"),
    );
    let mut engine = engine_with(&backend, two_device_config());

    let err = engine.start().unwrap_err();
    assert_eq!(err.channel(), Some(ChannelId::Aux));
    assert_eq!(backend.open_handles(), 0);
    assert!(!engine.is_running());
}

#[test]
fn test_capture_failure_opens_no_render_client() {
    let backend = FakeBackend::new()
        .failing_capture(NativeError::new(NativeErrorKind::AccessDenied, "microphone privacy"));
    let mut engine = engine_with(&backend, two_device_config());

    let err = engine.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    assert_eq!(err.channel(), None);
    assert_eq!(backend.render_clients_opened(), 0);
}

#[test]
fn test_restart_after_failed_start() {
    let backend = FakeBackend::new();
    let mut bad = two_device_config();
    bad.aux.device_id = Some(DeviceId::new("unplugged"));

    let mut engine = engine_with(&backend, bad);
    assert!(engine.start().is_err());
    assert_eq!(backend.open_handles(), 0);

    engine.apply_config(two_device_config()).unwrap();
    assert!(engine.is_running());
    assert_eq!(backend.open_handles(), 3);
}

// ============================================================================
// STOP
// ============================================================================

#[test]
fn test_stop_without_start() {
    let backend = FakeBackend::new();
    let mut engine = engine_with(&backend, two_device_config());
    engine.stop();
    engine.stop();
    assert_eq!(backend.captures_opened(), 0);
}

#[test]
fn test_double_stop_after_start() {
    let backend = FakeBackend::new();
    let mut engine = engine_with(&backend, two_device_config());
    engine.start().unwrap();

    engine.stop();
    engine.stop();
    assert_eq!(backend.open_handles(), 0);
    assert!(!engine.is_running());
}

#[test]
fn test_apply_config_reopens_every_device() {
    let backend = FakeBackend::new();
    let mut engine = engine_with(&backend, two_device_config());
    engine.start().unwrap();

    let mut next = two_device_config();
    next.aux.raw_mode = true;
    engine.apply_config(next).unwrap();

    assert_eq!(backend.captures_opened(), 2);
    assert_eq!(backend.render_clients_opened(), 4);
    assert_eq!(backend.open_handles(), 3);

    let last_aux = backend
        .initializations()
        .into_iter()
        .filter(|i| i.device.as_str() == "spdif")
        .last()
        .unwrap();
    assert!(last_aux.raw);
}

// ============================================================================
// STATUS DERIVATION
// ============================================================================

#[test]
fn test_shared_forced_resampler_matching_mix() {
    let backend = FakeBackend::new().with_mix_format("speakers", PcmFormat::int(44100, 16));
    let mut config = two_device_config();
    config.conversion = ConversionPolicy::Flexible;
    config.main.force_internal_resampler = true;
    config.main.bit_depth = 16;

    let mut engine = engine_with(&backend, config);
    engine.start().unwrap();

    let main = engine.status_snapshot().main;
    assert!(main.internal_resampler);
    assert!(!main.multi_stage_src);
}

#[test]
fn test_shared_forced_resampler_under_default_policy() {
    let backend = FakeBackend::new().with_mix_format("speakers", PcmFormat::int(44100, 16));
    let mut config = two_device_config();
    config.main.force_internal_resampler = true;
    config.main.bit_depth = 16;

    let mut engine = engine_with(&backend, config);
    engine.start().unwrap();

    let main = engine.status_snapshot().main;
    assert!(main.internal_resampler);
    assert!(!main.multi_stage_src);

    let inits = backend.initializations();
    let speakers = inits.iter().find(|i| i.device.as_str() == "speakers").unwrap();
    assert_eq!(speakers.format, PcmFormat::int(44100, 16));
}

#[test]
fn test_shared_without_resampler_flags_device_conversion() {
    // Source 48000/16 fed straight into a 44100 mix
    let backend = FakeBackend::new().with_mix_format("spdif", PcmFormat::int(44100, 16));
    let mut engine = engine_with(&backend, two_device_config());
    engine.start().unwrap();

    let aux = engine.status_snapshot().aux;
    assert!(!aux.internal_resampler);
    assert!(aux.multi_stage_src);

    let inits = backend.initializations();
    let spdif = inits.iter().find(|i| i.device.as_str() == "spdif").unwrap();
    assert_eq!(spdif.format, PcmFormat::int(48000, 16));
}

#[test]
fn test_exclusive_never_reports_multi_stage() {
    let backend = FakeBackend::new().with_mix_format("speakers", PcmFormat::int(44100, 16));
    let mut config = two_device_config();
    config.conversion = ConversionPolicy::Flexible;
    config.main.share_mode = SharePreference::Exclusive;
    config.main.sample_rate = 96000;

    let mut engine = engine_with(&backend, config);
    engine.start().unwrap();

    let main = engine.status_snapshot().main;
    assert!(main.internal_resampler);
    assert!(!main.multi_stage_src);
}

#[test]
fn test_status_resets_after_stop() {
    let backend = FakeBackend::new().with_mix_format("spdif", PcmFormat::int(44100, 16));
    let mut engine = engine_with(&backend, two_device_config());
    engine.start().unwrap();
    assert!(engine.status_snapshot().aux.multi_stage_src);

    engine.stop();
    let status = engine.status_snapshot();
    assert_eq!(status.aux, Default::default());
    assert_eq!(status.main, Default::default());
}
