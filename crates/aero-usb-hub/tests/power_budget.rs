mod util;

use std::time::Duration;

use aero_usb_hub::request::{REQ_CLEAR_FEATURE, REQ_SET_FEATURE};
use aero_usb_hub::{HostCapabilities, PortFeature, PortStatus, PowerEvent, Speed};
use pretty_assertions::assert_eq;
use util::{DeviceSpec, Harness};

fn budgeted(power_budget_ma: u32) -> HostCapabilities {
    HostCapabilities {
        power_budget_ma,
        ..HostCapabilities::default()
    }
}

#[test]
fn bus_powered_hub_accounts_for_every_child() {
    let h = Harness::new(budgeted(500), 4);
    h.attach(&[], 1, DeviceSpec::hub(Speed::High, 3).bus_powered(50));
    let hub = h.hub_at(&[1]);
    assert_eq!(hub.ma_per_port(), 100);
    assert!(hub.limited_power());

    h.attach(&[1], 1, DeviceSpec::function(Speed::High));
    h.attach(&[1], 2, DeviceSpec::function(Speed::High));
    assert_eq!(h.engine.power_remaining(&hub), 250);

    let greedy = h.attach(&[1], 3, DeviceSpec::function(Speed::High).with_max_power(150));
    h.engine.take_power_events();
    h.engine.set_configuration(&greedy, 1).unwrap();

    assert_eq!(h.engine.power_remaining(&hub), 0);
    assert_eq!(
        h.engine.take_power_events(),
        vec![
            PowerEvent::OverBudget {
                hub: "1-1".to_string(),
                port: 3,
                draw_ma: 300,
                budget_ma: 100,
            },
            PowerEvent::OverCommitted {
                hub: "1-1".to_string(),
                over_ma: 50,
            },
        ]
    );
}

#[test]
fn configured_children_draw_their_max_power() {
    let h = Harness::new(budgeted(500), 4);
    h.attach(&[], 1, DeviceSpec::hub(Speed::High, 4).bus_powered(100));
    let hub = h.hub_at(&[1]);

    let dev = h.attach(&[1], 1, DeviceSpec::function(Speed::High).with_max_power(25));
    assert_eq!(h.engine.power_remaining(&hub), 300);
    h.engine.set_configuration(&dev, 1).unwrap();
    assert_eq!(h.engine.power_remaining(&hub), 350);
}

#[test]
fn bus_powered_hub_without_a_unit_load_per_port_is_reported() {
    let h = Harness::new(budgeted(500), 4);
    h.attach(&[], 1, DeviceSpec::hub(Speed::High, 7).bus_powered(50));

    assert_eq!(
        h.engine.take_power_events(),
        vec![PowerEvent::InsufficientPower {
            hub: "1-1".to_string(),
            available_ma: 450,
            ports: 7,
        }]
    );
    // The hub is still usable.
    assert!(h.hub_at(&[1]).num_ports() == 7);
}

#[test]
fn self_powered_hubs_are_not_budgeted() {
    let h = Harness::high_speed(4);
    h.attach(&[], 1, DeviceSpec::hub(Speed::High, 4));
    let hub = h.hub_at(&[1]);
    h.attach(&[1], 1, DeviceSpec::function(Speed::High).with_max_power(250));

    assert!(!hub.limited_power());
    assert_eq!(hub.ma_per_port(), 500);
    assert_eq!(h.engine.power_remaining(&hub), 0);
    assert!(h.engine.take_power_events().is_empty());
}

#[test]
fn small_root_budget_limits_every_root_port() {
    let h = Harness::new(budgeted(300), 2);
    let root_hub = h.hub_at(&[]);
    assert!(root_hub.limited_power());
    assert_eq!(root_hub.ma_per_port(), 300);

    h.attach(&[], 1, DeviceSpec::function(Speed::High));
    assert_eq!(h.engine.power_remaining(&root_hub), 200);
}

#[test]
fn unconfigured_otg_device_draws_only_8ma() {
    let caps = HostCapabilities {
        power_budget_ma: 100,
        otg_port: Some(1),
        ..HostCapabilities::default()
    };
    let h = Harness::new(caps, 2);
    let root_hub = h.hub_at(&[]);

    h.attach(&[], 1, DeviceSpec::function(Speed::High));
    assert_eq!(h.engine.power_remaining(&root_hub), 92);

    h.attach(&[], 2, DeviceSpec::function(Speed::High));
    assert_eq!(h.engine.power_remaining(&root_hub), 0);
    assert!(h
        .engine
        .take_power_events()
        .iter()
        .any(|e| matches!(e, PowerEvent::OverCommitted { over_ma: 8, .. })));
}

#[test]
fn over_current_on_an_empty_port_repowers_it_after_a_cooldown() {
    let h = Harness::high_speed(4);
    h.sim.over_current(&[], 2);

    let mark = h.sim.request_count();
    let start = h.now();
    h.port_event(&[], 2);
    h.settle();

    let requests = h.sim.requests_since(mark);
    let cleared = requests
        .iter()
        .position(|r| r.is_port_feature(REQ_CLEAR_FEATURE, 2, PortFeature::COverCurrent))
        .expect("over-current change acknowledged");
    let powered = requests
        .iter()
        .position(|r| r.is_port_feature(REQ_SET_FEATURE, 2, PortFeature::Power))
        .expect("port power switched back on");
    assert!(cleared < powered);
    assert!(h.now() - start >= Duration::from_millis(200));

    let (status, change) = h.sim.port_words(&[], 2);
    assert!(status.contains(PortStatus::POWER));
    assert!(!status.contains(PortStatus::OVER_CURRENT));
    assert!(change.is_empty());
    assert!(h.device(&[2]).is_none());
}
