//! Integration tests for the stream lifecycle and concurrency contract
//!
//! Everything runs over the virtual (polling-model) backend: the tests
//! observe what the simulated hardware saw through its stream probes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aubade_core::domain::audio::{AudioError, SampleFormat};
use aubade_core::domain::config::AudioPreferences;
use aubade_core::domain::device::Host;
use aubade_core::domain::stream::StreamConfig;
use aubade_infra::audio::{Pacing, VirtualBackend, VirtualDeviceSpec};

fn wait_until(deadline_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn single_device_host() -> Host<VirtualBackend> {
    let mut spec = VirtualDeviceSpec::output("Test Output");
    spec.default_output = true;
    Host::new(VirtualBackend::new(vec![spec])).unwrap()
}

// ============================================================================
// NEGOTIATION ROUND-TRIPS
// ============================================================================

#[test]
fn test_resolver_output_always_opens() {
    let mut spec = VirtualDeviceSpec::output("Integer Device");
    spec.default_output = true;
    {
        let output = spec.output.as_mut().unwrap();
        // No f32 on purpose: the resolver has to fall through its
        // preference list.
        output.formats = vec![SampleFormat::I16, SampleFormat::I32];
        output.sample_rates = vec![44100, 48000, 96000];
        output.buffer_size = Some((64, 4096));
    }
    let host = Host::new(VirtualBackend::new(vec![spec])).unwrap();
    let device = host.default_output_device().unwrap();
    let configs = device.output_configs().unwrap();

    let prefs = AudioPreferences {
        sample_rate: 45000,
        buffer_size: Some(8192),
        ..Default::default()
    };
    let config = prefs.resolve(configs);
    assert_eq!(config.format, SampleFormat::I16);
    assert_eq!(config.sample_rate, 44100);
    assert_eq!(config.buffer_size, Some(4096));

    // A configuration produced entirely by the resolver must never be
    // rejected at bind time.
    let stream = host
        .open_output::<i16, _, _>(device, &config, |mut buffer, _info| buffer.silence(), |_e| {})
        .unwrap();
    stream.close().unwrap();
}

#[test]
fn test_open_fails_before_bind_when_direction_is_absent() {
    let spec = VirtualDeviceSpec {
        name: "Render-less".into(),
        output: None,
        ..Default::default()
    };
    let host = Host::new(VirtualBackend::new(vec![spec])).unwrap();
    let device = &host.devices()[0];

    let result = host.open_output::<f32, _, _>(
        device,
        &StreamConfig::default(),
        |_buffer, _info| {},
        |_e| {},
    );
    // Absent direction is a device error, not a config error, and no
    // hardware bind was ever attempted.
    assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
    assert!(host.backend().stream_probes().is_empty());
}

#[test]
fn test_hardware_rejection_is_unsupported_config() {
    let mut spec = VirtualDeviceSpec::output("Rejecting");
    spec.output.as_mut().unwrap().reject_open = true;
    let host = Host::new(VirtualBackend::new(vec![spec])).unwrap();
    let device = &host.devices()[0];
    let config = AudioPreferences::default().resolve(device.output_configs().unwrap());

    let result =
        host.open_output::<f32, _, _>(device, &config, |_buffer, _info| {}, |_e| {});
    assert!(matches!(result, Err(AudioError::UnsupportedConfig(_))));
}

#[test]
fn test_virtual_backend_has_no_capture() {
    let host = single_device_host();
    let device = &host.devices()[0];
    assert!(device.input_configs().is_none());

    let result = host.open_input::<f32, _, _>(
        device,
        &StreamConfig::default(),
        |_buffer, _info| {},
        |_e| {},
    );
    assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
}

// ============================================================================
// LIFECYCLE & CONCURRENCY
// ============================================================================

fn open_silence_stream(
    host: &Host<VirtualBackend>,
) -> (aubade_core::domain::stream::Stream, Arc<AtomicU32>) {
    let device = host.default_output_device().unwrap();
    let config = AudioPreferences::default().resolve(device.output_configs().unwrap());
    let errors = Arc::new(AtomicU32::new(0));
    let errors_cb = Arc::clone(&errors);
    let stream = host
        .open_output::<f32, _, _>(
            device,
            &config,
            |mut buffer, _info| buffer.silence(),
            move |_e| {
                errors_cb.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    (stream, errors)
}

#[test]
fn test_close_immediately_after_play_leaves_hardware_stopped() {
    let host = single_device_host();
    let (stream, _errors) = open_silence_stream(&host);
    let probe = host.backend().last_stream_probe().unwrap();

    stream.play().unwrap();
    // No intervening pause. When close returns, the audio thread has
    // fully exited: every hardware start has been matched by a stop.
    stream.close().unwrap();
    assert!(!probe.is_started());
    assert_eq!(probe.start_count(), probe.stop_count());
}

#[test]
fn test_play_renders_into_the_device() {
    let host = single_device_host();
    let (stream, errors) = open_silence_stream(&host);
    let probe = host.backend().last_stream_probe().unwrap();

    assert!(!stream.is_playing());
    stream.play().unwrap();
    assert!(stream.is_playing());
    assert!(wait_until(2000, || probe.rendered_frames() > 0));
    assert!(probe.is_started());

    stream.close().unwrap();
    assert!(!probe.is_started());
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[test]
fn test_pause_stops_rendering_and_play_resumes() {
    let host = single_device_host();
    let (stream, _errors) = open_silence_stream(&host);
    let probe = host.backend().last_stream_probe().unwrap();

    stream.play().unwrap();
    assert!(wait_until(2000, || probe.rendered_frames() > 0));

    stream.pause().unwrap();
    assert!(!stream.is_playing());
    assert!(wait_until(2000, || !probe.is_started()));
    let rendered_at_pause = probe.rendered_frames();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(probe.rendered_frames(), rendered_at_pause);

    stream.play().unwrap();
    assert!(wait_until(2000, || probe.rendered_frames() > rendered_at_pause));
    assert_eq!(probe.start_count(), 2);

    stream.close().unwrap();
    assert_eq!(probe.stop_count(), 2);
}

#[test]
fn test_nine_consecutive_failures_report_exactly_eight_errors() {
    let host = single_device_host();
    let (stream, errors) = open_silence_stream(&host);
    let probe = host.backend().last_stream_probe().unwrap();

    probe.inject_failures(9);
    stream.play().unwrap();

    assert!(wait_until(2000, || errors.load(Ordering::SeqCst) == 8));
    std::thread::sleep(Duration::from_millis(20));
    // The thread terminated at the consecutive-failure limit: the ninth
    // fault was never consumed and never reported.
    assert_eq!(errors.load(Ordering::SeqCst), 8);
    assert_eq!(probe.pending_failures(), 1);
    assert!(!probe.is_started());
    assert_eq!(probe.rendered_frames(), 0);

    // Closing after self-termination is still clean.
    stream.close().unwrap();
}

#[test]
fn test_transient_failures_do_not_kill_the_stream() {
    let host = single_device_host();
    let (stream, errors) = open_silence_stream(&host);
    let probe = host.backend().last_stream_probe().unwrap();

    probe.inject_failures(3);
    stream.play().unwrap();

    assert!(wait_until(2000, || probe.rendered_frames() > 0));
    assert_eq!(errors.load(Ordering::SeqCst), 3);
    assert!(probe.is_started());
    stream.close().unwrap();
}

#[test]
fn test_rendered_samples_arrive_in_callback_order() {
    let host = single_device_host();
    let device = host.default_output_device().unwrap();
    let config = AudioPreferences::default().resolve(device.output_configs().unwrap());

    let mut next = 0i16;
    let stream = host
        .open_output::<i16, _, _>(
            device,
            &StreamConfig {
                format: SampleFormat::I16,
                ..config
            },
            move |mut buffer, _info| {
                for sample in buffer.samples_mut() {
                    *sample = next;
                    next = next.wrapping_add(1);
                }
            },
            |_e| {},
        )
        .unwrap();
    let probe = host.backend().last_stream_probe().unwrap();

    stream.play().unwrap();
    assert!(wait_until(2000, || probe.rendered_frames() >= 64));
    stream.close().unwrap();

    let bytes = probe.captured_bytes();
    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|b| i16::from_ne_bytes([b[0], b[1]]))
        .collect();
    assert!(samples.len() >= 128);
    for (i, sample) in samples.iter().take(256).enumerate() {
        assert_eq!(*sample, i as i16);
    }
}

#[test]
fn test_realtime_pacing_renders_on_the_device_clock() {
    let mut spec = VirtualDeviceSpec::output("Paced Output");
    spec.default_output = true;
    spec.pacing = Pacing::Realtime;
    let host = Host::new(VirtualBackend::new(vec![spec])).unwrap();
    let device = host.default_output_device().unwrap();
    let config = StreamConfig {
        format: SampleFormat::F32,
        sample_rate: 48000,
        buffer_size: Some(64),
    };

    let stream = host
        .open_output::<f32, _, _>(device, &config, |mut buffer, _info| buffer.silence(), |_e| {})
        .unwrap();
    let probe = host.backend().last_stream_probe().unwrap();

    stream.play().unwrap();
    assert!(wait_until(2000, || probe.rendered_frames() > 0));
    stream.close().unwrap();
    assert!(!probe.is_started());
}

#[test]
fn test_drop_performs_the_close_teardown() {
    let host = single_device_host();
    let (stream, _errors) = open_silence_stream(&host);
    let probe = host.backend().last_stream_probe().unwrap();

    stream.play().unwrap();
    assert!(wait_until(2000, || probe.rendered_frames() > 0));
    drop(stream);
    assert!(!probe.is_started());
    assert_eq!(probe.start_count(), probe.stop_count());
}
