mod util;

use std::sync::Arc;
use std::time::Duration;

use aero_usb_hub::request::{REQ_CLEAR_FEATURE, REQ_CLEAR_TT_BUFFER, REQ_SET_FEATURE};
use aero_usb_hub::{tt_devinfo, DeviceState, HubError, PortFeature, Speed, TransferError};
use pretty_assertions::assert_eq;
use util::{DeviceSpec, Harness};

#[test]
fn status_read_errors_escalate_to_a_hub_reset_on_the_tenth() {
    let h = Harness::high_speed(4);
    let dev = h.attach(&[], 1, DeviceSpec::function(Speed::High));
    let hub = h.hub_at(&[]);
    let reads = h.sim.status_reads();

    for _ in 0..9 {
        h.engine.hub_irq(&hub, Err(TransferError::Protocol));
    }
    assert!(!hub.has_error());
    assert!(!h.engine.has_pending_work());
    assert_eq!(h.sim.status_reads(), reads + 9);

    // Cancellation on shutdown does not count.
    h.engine.hub_irq(&hub, Err(TransferError::Shutdown));
    assert!(!hub.has_error());

    h.engine.hub_irq(&hub, Err(TransferError::Protocol));
    assert!(hub.has_error());
    assert!(h.engine.has_pending_work());

    h.settle();
    assert!(!hub.has_error());
    assert_eq!(dev.state(), DeviceState::NotAttached);
    let fresh = h.device(&[1]).expect("device re-enumerated after the hub reset");
    assert!(!Arc::ptr_eq(&fresh, &dev));
    assert_eq!(fresh.state(), DeviceState::Address);
}

#[test]
fn a_good_completion_resets_the_error_count() {
    let h = Harness::high_speed(4);
    let hub = h.hub_at(&[]);

    for _ in 0..9 {
        h.engine.hub_irq(&hub, Err(TransferError::Timeout));
    }
    h.engine.hub_irq(&hub, Ok(&[0u8, 0][..]));
    h.settle();
    for _ in 0..9 {
        h.engine.hub_irq(&hub, Err(TransferError::Timeout));
    }
    assert!(!hub.has_error());
}

#[test]
fn change_bitmap_only_visits_flagged_ports() {
    let h = Harness::high_speed(4);
    h.sim.plug(&[], 3, DeviceSpec::function(Speed::High));

    // Port 2 is flagged but has nothing to report; port 3 is not flagged.
    h.port_event(&[], 2);
    h.settle();
    assert!(h.device(&[3]).is_none());

    h.port_event(&[], 3);
    h.settle();
    assert!(h.device(&[3]).is_some());
}

#[test]
fn external_hub_is_reset_after_errors_and_children_re_enumerated() {
    let h = Harness::high_speed(4);
    let hub_dev = h.attach(&[], 1, DeviceSpec::hub(Speed::High, 2));
    h.attach(&[1], 2, DeviceSpec::function(Speed::High));
    let hub = h.hub_at(&[1]);

    for _ in 0..10 {
        h.engine.hub_irq(&hub, Err(TransferError::Protocol));
    }
    h.settle();

    assert!(!hub.has_error());
    assert_eq!(hub_dev.state(), DeviceState::Configured);
    assert!(Arc::ptr_eq(&h.device(&[1]).unwrap(), &hub_dev));
    let child = h.device(&[1, 2]).expect("child re-enumerated");
    assert_eq!(child.state(), DeviceState::Address);
}

#[test]
fn hub_over_current_repowers_every_port() {
    let h = Harness::high_speed(2);
    h.attach(&[], 1, DeviceSpec::hub(Speed::High, 3));
    h.sim.with_device(&[1], |d| d.hub_change |= 0x2);

    let mark = h.sim.request_count();
    let start = h.now();
    let hub = h.hub_at(&[1]);
    h.engine.hub_irq(&hub, Ok(&[0x01u8][..]));
    h.settle();

    let requests = h.sim.requests_since(mark);
    assert!(requests.iter().any(|r| {
        r.route == [1] && r.setup.bm_request_type == 0x20 && r.setup.b_request == REQ_CLEAR_FEATURE
    }));
    for port in 1..=3 {
        assert!(requests
            .iter()
            .any(|r| r.route == [1] && r.is_port_feature(REQ_SET_FEATURE, port, PortFeature::Power)));
    }
    assert!(h.now() - start >= Duration::from_millis(600));
    assert_eq!(h.sim.with_device(&[1], |d| d.hub_change), 0);
}

#[test]
fn lost_local_power_limits_the_hub() {
    let h = Harness::high_speed(2);
    h.attach(&[], 1, DeviceSpec::hub(Speed::High, 3));
    let hub = h.hub_at(&[1]);
    assert!(!hub.limited_power());

    h.sim.with_device(&[1], |d| {
        d.hub_status |= 0x1;
        d.hub_change |= 0x1;
    });
    h.engine.hub_irq(&hub, Ok(&[0x01u8][..]));
    h.settle();

    assert!(hub.limited_power());
}

#[test]
fn wakeup_notification_ignores_ports_out_of_range() {
    let h = Harness::high_speed(2);
    let root = h.root();

    h.engine.wakeup_notification(&root, 0);
    h.engine.wakeup_notification(&root, 3);
    assert!(!h.engine.has_pending_work());

    h.engine.wakeup_notification(&root, 2);
    assert!(h.engine.has_pending_work());
    h.settle();
    assert!(!h.engine.has_pending_work());
}

#[test]
fn tt_buffer_clears_go_out_in_order_with_control_in_both_directions() {
    let h = Harness::high_speed(2);
    h.attach(&[], 1, DeviceSpec::hub(Speed::High, 4));
    let dev = h.attach(&[1], 1, DeviceSpec::function(Speed::Full));
    let devnum = dev.devnum();
    let hub = h.hub_at(&[1]);

    h.engine.clear_tt_buffer(&dev, 0x81, false).unwrap();
    h.engine.clear_tt_buffer(&dev, 0x00, true).unwrap();
    h.engine.clear_tt_buffer(&dev, 0x02, false).unwrap();
    assert_eq!(hub.pending_tt_clears(), 3);

    let mark = h.sim.request_count();
    h.settle();

    let clears: Vec<(u16, u16)> = h
        .sim
        .requests_since(mark)
        .iter()
        .filter(|r| r.route == [1] && r.setup.b_request == REQ_CLEAR_TT_BUFFER)
        .map(|r| (r.setup.w_value, r.setup.w_index))
        .collect();
    let control = tt_devinfo(0x00, devnum, true);
    assert_eq!(
        clears,
        vec![
            (tt_devinfo(0x81, devnum, false), 1),
            (control ^ 0x8000, 1),
            (control, 1),
            (tt_devinfo(0x02, devnum, false), 1),
        ]
    );
    assert_eq!(h.sim.tt_completions(), vec![0x81, 0x00, 0x02]);
    assert_eq!(hub.pending_tt_clears(), 0);
}

#[test]
fn multi_tt_hubs_clear_the_tt_of_the_device_port() {
    let h = Harness::high_speed(2);
    h.attach(&[], 1, DeviceSpec::hub(Speed::High, 4).multi_tt());
    let dev = h.attach(&[1], 3, DeviceSpec::function(Speed::Low));

    let mark = h.sim.request_count();
    h.engine.clear_tt_buffer(&dev, 0x81, false).unwrap();
    h.settle();

    let indices: Vec<u16> = h
        .sim
        .requests_since(mark)
        .iter()
        .filter(|r| r.setup.b_request == REQ_CLEAR_TT_BUFFER)
        .map(|r| r.setup.w_index)
        .collect();
    assert_eq!(indices, vec![3]);
}

#[test]
fn high_speed_devices_have_no_tt_to_clear() {
    let h = Harness::high_speed(2);
    let dev = h.attach(&[], 1, DeviceSpec::function(Speed::High));
    assert!(matches!(
        h.engine.clear_tt_buffer(&dev, 0x81, false),
        Err(HubError::NoDevice)
    ));
}

#[test]
fn pending_tt_clears_complete_when_the_hub_goes_away() {
    let h = Harness::high_speed(2);
    h.attach(&[], 1, DeviceSpec::hub(Speed::High, 4));
    let dev = h.attach(&[1], 2, DeviceSpec::function(Speed::Full));
    let hub = h.hub_at(&[1]);

    h.engine.clear_tt_buffer(&dev, 0x81, false).unwrap();
    h.detach(&[], 1);

    assert_eq!(hub.pending_tt_clears(), 0);
    assert_eq!(h.sim.tt_completions(), vec![0x81]);
}
