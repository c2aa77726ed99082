//! The per-hub event pass and the interrupt-side entry points that feed it.

use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

use tracing::{debug, error, warn};

use crate::activate::QuiesceKind;
use crate::clock::ms;
use crate::device::{Device, DeviceState};
use crate::engine::HubEngine;
use crate::error::TransferError;
use crate::hub::Hub;
use crate::reset::BH_RESET_TIME_MS;
use crate::status::{HubChange, HubFeature, HubStatus, LinkState, PortChange, PortFeature, PortStatus};

/// Consecutive status read failures tolerated before the hub is re-initialized.
const MAX_STATUS_ERRORS: u32 = 10;
const HUB_OVER_CURRENT_COOLDOWN_MS: u64 = 500;
const PORT_OVER_CURRENT_COOLDOWN_MS: u64 = 100;
/// A device signalling remote wakeup needs this long before it can be talked to.
const REMOTE_WAKEUP_SETTLE_MS: u64 = 10;

/// The hub device lock held by one event pass, released around long waits.
pub(crate) struct HubPass<'a> {
    hdev: &'a Device,
    guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> HubPass<'a> {
    fn lock(hdev: &'a Device) -> Self {
        Self {
            hdev,
            guard: Some(hdev.lock_device()),
        }
    }

    /// Runs `f` without the hub device lock. `port` is marked busy meanwhile so that no other
    /// pass touches it.
    pub(crate) fn unlocked<T>(&mut self, hub: &Hub, port: u8, f: impl FnOnce() -> T) -> T {
        hub.busy_bits.set(port);
        self.guard = None;
        let out = f();
        self.guard = Some(self.hdev.lock_device());
        hub.busy_bits.clear(port);
        out
    }
}

/// Drops the queue's reference on the hub's pending count once the pass is over.
struct PendingGuard<'a>(&'a Hub);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl HubEngine {
    /// Queues `hub` for a pass unless it is shutting its activity down.
    pub fn kick(&self, hub: &Arc<Hub>) {
        if hub.is_quiescing() || hub.is_disconnected() {
            return;
        }
        self.queue.push(hub);
    }

    /// Completion of the hub's status-change read. `Ok` carries the little-endian change bitmap:
    /// bit 0 is the hub itself, bit `n` is port `n`.
    pub fn hub_irq(&self, hub: &Arc<Hub>, result: std::result::Result<&[u8], TransferError>) {
        match result {
            Err(TransferError::Shutdown) => return,
            Err(err) => {
                let nerrors = hub.nerrors.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(hub = %hub.name(), error = %err, nerrors, "transfer error");
                if nerrors < MAX_STATUS_ERRORS || hub.has_error() {
                    self.resubmit_status_read(hub);
                    return;
                }
                hub.error.store(true, Ordering::Release);
            }
            Ok(data) => {
                let bits = data
                    .iter()
                    .take(4)
                    .enumerate()
                    .fold(0u32, |bits, (i, byte)| bits | u32::from(*byte) << (8 * i));
                hub.event_bits.or(bits);
            }
        }

        hub.nerrors.store(0, Ordering::Release);
        self.kick(hub);
        self.resubmit_status_read(hub);
    }

    fn resubmit_status_read(&self, hub: &Hub) {
        if hub.is_quiescing() {
            return;
        }
        let Some(hdev) = hub.hdev() else {
            return;
        };
        if let Err(err) = hdev.controller.submit_status_read(&hdev) {
            if err != TransferError::NoDevice {
                error!(hub = %hub.name(), error = %err, "resubmit status read failed");
            }
        }
    }

    /// A SuperSpeed device below `hdev` sent a function wake notification on `port`.
    pub fn wakeup_notification(&self, hdev: &Device, port: u8) {
        let Some(hub) = hdev.hub() else {
            return;
        };
        if port == 0 || port > hub.num_ports() {
            return;
        }
        hub.wakeup_bits.set(port);
        self.kick(&hub);
    }

    pub(crate) fn hub_event(&self, hub: Arc<Hub>) {
        let _pending = PendingGuard(&hub);
        if hub.is_disconnected() {
            return;
        }
        let Some(hdev) = hub.hdev() else {
            return;
        };
        let mut pass = HubPass::lock(&hdev);

        debug!(
            hub = %hub.name(),
            state = ?hdev.state(),
            event = format_args!("{:#x}", hub.event_bits.load()),
            change = format_args!("{:#x}", hub.change_bits.load()),
            "hub event"
        );

        if hub.is_disconnected() {
            return;
        }
        if hdev.state() == DeviceState::NotAttached {
            hub.error.store(true, Ordering::Release);
            self.quiesce(&hub, QuiesceKind::Disconnect);
            return;
        }
        if hub.is_quiescing() {
            return;
        }

        if hub.has_error() {
            debug!(hub = %hub.name(), "resetting for error");
            if hdev.is_root_hub() {
                self.hub_pre_reset(&hub);
                self.hub_post_reset(&hub);
            } else if let Err(err) = self.reset_device_locked(&hdev) {
                debug!(hub = %hub.name(), error = %err, "error resetting hub");
                return;
            }
            hub.nerrors.store(0, Ordering::Release);
            hub.error.store(false, Ordering::Release);
        }

        if hub.event_bits.test_and_clear(0) {
            self.handle_hub_status(&mut pass, &hub);
        }

        for port in 1..=hub.num_ports() {
            if hub.is_quiescing() {
                break;
            }
            if hub.busy_bits.test(port) {
                continue;
            }
            self.handle_port_event(&mut pass, &hub, port);
        }
    }

    fn handle_hub_status(&self, pass: &mut HubPass<'_>, hub: &Arc<Hub>) {
        let (status, change) = match self.hub_status(hub) {
            Ok(words) => words,
            Err(err) => {
                error!(hub = %hub.name(), error = %err, "get_hub_status failed");
                return;
            }
        };

        if change.contains(HubChange::LOCAL_POWER) {
            debug!(hub = %hub.name(), "power change");
            let _ = self.clear_hub_feature(hub, HubFeature::CLocalPower);
            // A lost local supply leaves the hub running on bus power.
            hub.limited_power
                .store(status.contains(HubStatus::LOCAL_POWER), Ordering::Release);
        }
        if change.contains(HubChange::OVER_CURRENT) {
            debug!(hub = %hub.name(), "over-current change");
            let _ = self.clear_hub_feature(hub, HubFeature::COverCurrent);
            pass.unlocked(hub, 0, || self.sleep(ms(HUB_OVER_CURRENT_COOLDOWN_MS)));
            self.power_on(hub, true);
            if let Ok((status, _)) = self.hub_status(hub) {
                if status.contains(HubStatus::OVER_CURRENT) {
                    error!(hub = %hub.name(), "over-current condition");
                }
            }
        }
    }

    fn handle_port_event(&self, pass: &mut HubPass<'_>, hub: &Arc<Hub>, port: u8) {
        let mut connect_change = hub.change_bits.test(port);
        let wakeup = hub.wakeup_bits.test_and_clear(port);
        let event = hub.event_bits.test_and_clear(port);
        if !connect_change && !wakeup && !event {
            return;
        }

        let (mut status, mut change) = match self.port_status(hub, port) {
            Ok(words) => words,
            Err(err) => {
                debug!(hub = %hub.name(), port, error = %err, "port status read failed");
                return;
            }
        };
        let superspeed = hub.is_superspeed();
        let child = hub.port(port).and_then(|p| p.child());

        if change.contains(PortChange::CONNECTION) {
            let _ = self.clear_port_feature(hub, port, PortFeature::CConnection);
            connect_change = true;
        }

        if change.contains(PortChange::ENABLE) {
            if !connect_change {
                debug!(hub = %hub.name(), port, ?status, "enable change");
            }
            let _ = self.clear_port_feature(hub, port, PortFeature::CEnable);

            // Something may have disabled the port behind our back; have it re-enumerated.
            if !status.contains(PortStatus::ENABLE) && !connect_change && child.is_some() {
                error!(hub = %hub.name(), port, "disabled by hub (EMI?), re-enabling...");
                connect_change = true;
            }
        }

        if self.handle_remote_wakeup(hub, port, status, change, child.as_ref()) {
            connect_change = true;
        }

        if change.contains(PortChange::OVER_CURRENT) {
            debug!(hub = %hub.name(), port, "over-current change");
            let _ = self.clear_port_feature(hub, port, PortFeature::COverCurrent);
            pass.unlocked(hub, port, || self.sleep(ms(PORT_OVER_CURRENT_COOLDOWN_MS)));
            if hub.is_quiescing() {
                return;
            }
            self.power_on(hub, true);
            if let Ok((s, c)) = self.port_status(hub, port) {
                status = s;
                change = c;
                if status.contains(PortStatus::OVER_CURRENT) {
                    error!(hub = %hub.name(), port, "over-current condition");
                }
            }
        }

        if change.contains(PortChange::RESET) {
            debug!(hub = %hub.name(), port, "reset change");
            let _ = self.clear_port_feature(hub, port, PortFeature::CReset);
        }
        if superspeed && change.contains(PortChange::BH_RESET) {
            debug!(hub = %hub.name(), port, "warm reset change");
            let _ = self.clear_port_feature(hub, port, PortFeature::CBhReset);
        }
        if change.contains(PortChange::LINK_STATE) {
            debug!(hub = %hub.name(), port, "link state change");
            let _ = self.clear_port_feature(hub, port, PortFeature::CLinkState);
        }
        if change.contains(PortChange::CONFIG_ERROR) {
            warn!(hub = %hub.name(), port, "config error");
            let _ = self.clear_port_feature(hub, port, PortFeature::CConfigError);
        }

        if status.warm_reset_required(superspeed) {
            let child = hub.port(port).and_then(|p| p.child());
            match child.filter(|c| c.state() != DeviceState::NotAttached) {
                Some(child) if status.contains(PortStatus::CONNECTION) => {
                    debug!(hub = %hub.name(), port, "do warm reset, full device");
                    let _guard = child.lock_device();
                    if let Err(err) = self.reset_device_locked(&child) {
                        debug!(device = %child.name(), error = %err, "warm reset of device failed");
                    }
                    connect_change = false;
                }
                _ => {
                    debug!(hub = %hub.name(), port, "do warm reset, port only");
                    if self
                        .port_reset(hub, port, None, ms(BH_RESET_TIME_MS), true)
                        .is_err()
                    {
                        let _ = self.port_disable(hub, port, true);
                    }
                }
            }
        }

        if connect_change && !hub.is_quiescing() {
            self.port_connect_change(pass, hub, port, status, change);
        }
    }

    /// Returns whether the port needs to be treated as a connect change.
    fn handle_remote_wakeup(
        &self,
        hub: &Arc<Hub>,
        port: u8,
        status: PortStatus,
        change: PortChange,
        child: Option<&Arc<Device>>,
    ) -> bool {
        if hub.is_superspeed() {
            let suspended_child = child.is_some_and(|c| c.state() == DeviceState::Suspended);
            if !suspended_child || status.link_state() != LinkState::U0 {
                return false;
            }
        } else {
            if !change.contains(PortChange::SUSPEND) {
                return false;
            }
            let _ = self.clear_port_feature(hub, port, PortFeature::CSuspend);
        }

        match child {
            Some(child) => {
                self.sleep(ms(REMOTE_WAKEUP_SETTLE_MS));
                match self.remote_wakeup(child) {
                    Ok(()) => {
                        debug!(device = %child.name(), "resumed by remote wakeup");
                        false
                    }
                    Err(err) => {
                        debug!(device = %child.name(), error = %err, "remote wakeup failed");
                        true
                    }
                }
            }
            None => {
                let _ = self.port_disable(hub, port, true);
                false
            }
        }
    }
}
