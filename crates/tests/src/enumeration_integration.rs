//! Integration tests for host enumeration robustness
//!
//! One misbehaving device must never blank out the host's device list, and
//! default-device references have to keep pointing at the right entry.

use aubade_core::domain::audio::SampleFormat;
use aubade_core::domain::config::AudioPreferences;
use aubade_core::domain::device::Host;
use aubade_infra::audio::{VirtualBackend, VirtualDeviceSpec};

fn mixed_host() -> Host<VirtualBackend> {
    // A direction-less device, a device whose capability query is broken,
    // and a healthy default device, in that order.
    let unusable = VirtualDeviceSpec {
        name: "Unusable".into(),
        output: None,
        ..Default::default()
    };

    let mut flaky = VirtualDeviceSpec::output("Flaky");
    flaky.output.as_mut().unwrap().broken_probe = true;

    let mut healthy = VirtualDeviceSpec::output("Healthy");
    healthy.default_output = true;

    Host::new(VirtualBackend::new(vec![unusable, flaky, healthy])).unwrap()
}

#[test]
fn test_bad_devices_do_not_abort_enumeration() {
    let host = mixed_host();
    assert_eq!(host.devices().len(), 3);

    // Unusable and broken devices stay enumerable, just without the
    // affected direction.
    assert!(host.devices()[0].output_configs().is_none());
    assert!(host.devices()[1].output_configs().is_none());
    assert!(host.devices()[2].output_configs().is_some());
}

#[test]
fn test_default_reference_points_into_the_device_list() {
    let host = mixed_host();
    let default = host.default_output_device().unwrap();
    assert_eq!(default.name(), "Healthy");
    // The back-reference resolves to the same entry the list holds.
    assert!(std::ptr::eq(default, &host.devices()[2]));
    assert!(host.default_input_device().is_none());
}

#[test]
fn test_find_device_by_name() {
    let host = mixed_host();
    assert!(host.find_device("Flaky").is_some());
    assert!(host.find_device("Missing").is_none());
}

#[test]
fn test_preferences_resolve_against_enumerated_capabilities() {
    let host = mixed_host();
    let device = host.default_output_device().unwrap();
    let configs = device.output_configs().unwrap();

    let prefs = AudioPreferences::default();
    let config = prefs.resolve(configs);
    assert_eq!(config.format, SampleFormat::F32);
    assert!(configs.supports_sample_rate(config.sample_rate));
    if let Some(frames) = config.buffer_size {
        assert!(configs.supports_buffer_size(frames));
    }
}

#[test]
fn test_empty_host_is_valid() {
    let host = Host::new(VirtualBackend::new(vec![])).unwrap();
    assert!(host.devices().is_empty());
    assert!(host.default_output_device().is_none());
    assert!(host.default_input_device().is_none());
}
