mod util;

use std::time::Duration;

use aero_usb_hub::request::REQ_SET_FEATURE;
use aero_usb_hub::{
    DebounceConfig, HostCapabilities, HubConfig, HubError, PortFeature, PortStatus, Speed,
};
use util::{DeviceSpec, Harness};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn debounce_of_a_flapping_port_times_out_after_the_window() {
    let config = HubConfig {
        debounce: DebounceConfig {
            timeout: ms(1500),
            ..DebounceConfig::default()
        },
        ..HubConfig::default()
    };
    let h = Harness::with_config(HostCapabilities::default(), 4, config);
    let hub = h.hub_at(&[]);

    h.sim.plug(&[], 1, DeviceSpec::function(Speed::High));
    h.sim.flap(&[], 1, ms(30));

    let start = h.now();
    let err = h.engine.port_debounce(&hub, 1, true).unwrap_err();
    assert!(matches!(err, HubError::Timeout(_)), "got {err:?}");
    assert_eq!(h.now() - start, ms(1500));
}

#[test]
fn debounce_of_a_steady_connection_returns_after_the_stable_interval() {
    let h = Harness::high_speed(4);
    let hub = h.hub_at(&[]);
    h.sim.plug(&[], 2, DeviceSpec::function(Speed::High));

    let start = h.now();
    let status = h.engine.port_debounce(&hub, 2, true).unwrap();
    assert!(status.contains(PortStatus::CONNECTION));
    // The first poll only records the connect change.
    assert_eq!(h.now() - start, ms(100));
    assert!(h.sim.port_words(&[], 2).1.is_empty());
}

#[test]
fn debounce_of_an_empty_port_needs_a_connection() {
    let h = Harness::high_speed(4);
    let hub = h.hub_at(&[]);

    let err = h.engine.port_debounce(&hub, 3, true).unwrap_err();
    assert!(matches!(err, HubError::Timeout(_)));

    let status = h.engine.port_debounce(&hub, 3, false).unwrap();
    assert!(!status.contains(PortStatus::CONNECTION));
}

#[test]
fn reset_escalates_to_the_long_delay_after_two_short_attempts() {
    let h = Harness::high_speed(4);
    let hub = h.hub_at(&[]);
    h.sim.plug(&[], 1, DeviceSpec::function(Speed::High));
    h.sim.set_reset_failures(&[], 1, 4);
    h.engine
        .clear_port_feature(&hub, 1, PortFeature::CConnection)
        .unwrap();

    let mark = h.sim.request_count();
    let start = h.now();
    let speed = h.engine.port_reset(&hub, 1, None, ms(10), false).unwrap();
    assert_eq!(speed, Speed::High);

    // 10 + 10 + 200 + 200 + 200 of polling, then reset recovery.
    assert_eq!(h.now() - start, ms(670));
    let resets = h
        .sim
        .requests_since(mark)
        .iter()
        .filter(|r| r.is_port_feature(REQ_SET_FEATURE, 1, PortFeature::Reset))
        .count();
    assert_eq!(resets, 5);
}

#[test]
fn reset_gives_up_after_five_attempts() {
    let h = Harness::high_speed(4);
    let hub = h.hub_at(&[]);
    h.sim.plug(&[], 1, DeviceSpec::function(Speed::Full));
    h.sim.set_reset_failures(&[], 1, 10);
    h.engine
        .clear_port_feature(&hub, 1, PortFeature::CConnection)
        .unwrap();

    let err = h.engine.port_reset(&hub, 1, None, ms(10), false).unwrap_err();
    assert!(matches!(err, HubError::Timeout(_)), "got {err:?}");
}

#[test]
fn reset_of_an_empty_port_reports_no_device() {
    let h = Harness::high_speed(4);
    let hub = h.hub_at(&[]);

    let err = h.engine.port_reset(&hub, 4, None, ms(10), false).unwrap_err();
    assert!(err.is_no_device(), "got {err:?}");
}

#[test]
fn warm_reset_is_refused_on_a_usb2_hub() {
    let h = Harness::high_speed(4);
    let hub = h.hub_at(&[]);
    let err = h.engine.port_reset(&hub, 1, None, ms(50), true).unwrap_err();
    assert!(matches!(err, HubError::Invalid(_)));
}

#[test]
fn reset_reports_the_speed_the_port_comes_up_at() {
    let h = Harness::high_speed(4);
    let hub = h.hub_at(&[]);
    h.sim.plug(&[], 3, DeviceSpec::function(Speed::Low));
    h.engine
        .clear_port_feature(&hub, 3, PortFeature::CConnection)
        .unwrap();

    assert_eq!(
        h.engine.port_reset(&hub, 3, None, ms(10), false).unwrap(),
        Speed::Low
    );
    let (status, change) = h.sim.port_words(&[], 3);
    assert!(status.contains(PortStatus::ENABLE));
    assert!(change.is_empty());
}
