//! Bringing a hub's ports up (`activate`) and shutting its activity down (`quiesce`).
//!
//! Activation after configuration is staged: `Init` switches port power on and defers the
//! power-good wait as `Init2`; `Init2` clears stale change bits and, if any were set, defers the
//! debounce wait as `Init3`. The other kinds run every stage inline.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error};

use crate::clock::ms;
use crate::device::{set_state_locked, DeviceState};
use crate::engine::HubEngine;
use crate::events::Deferred;
use crate::hub::Hub;
use crate::indicator::LED_CYCLE_PERIOD;
use crate::request::SetupPacket;
use crate::status::{LinkState, PortChange, PortFeature, PortStatus};

/// How long connection status must be stable before the port counts as settled.
pub(crate) const DEBOUNCE_STABLE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateKind {
    Init,
    Init2,
    Init3,
    PostReset,
    Resume,
    ResetResume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiesceKind {
    Disconnect,
    PreReset,
    Suspend,
}

impl HubEngine {
    pub(crate) fn activate(&self, hub: &Arc<Hub>, kind: ActivateKind) {
        let Some(hdev) = hub.hdev() else {
            return;
        };

        match kind {
            ActivateKind::Init2 => return self.activate_ports(hub, kind),
            ActivateKind::Init3 => return self.activate_finish(hub),
            ActivateKind::Resume => {}
            _ => {
                if hdev.parent().is_some() && hub.is_superspeed() {
                    let depth = u16::from(hdev.level().saturating_sub(1));
                    if let Err(err) =
                        hdev.control_out(SetupPacket::set_hub_depth(depth), self.config.control_timeout)
                    {
                        error!(hub = %hub.name(), error = %err, "set hub depth failed");
                    }
                }
                if kind == ActivateKind::Init {
                    let delay = self.power_on(hub, false);
                    self.queue.schedule(
                        hub,
                        Deferred::Activate(ActivateKind::Init2),
                        self.clock.now() + delay,
                    );
                    return;
                }
                if kind == ActivateKind::ResetResume {
                    hdev.controller.update_device(&hdev);
                }
                self.power_on(hub, true);
            }
        }
        self.activate_ports(hub, kind);
    }

    fn activate_ports(&self, hub: &Arc<Hub>, kind: ActivateKind) {
        let superspeed = hub.is_superspeed();
        let mut need_debounce_delay = false;

        for port in &hub.ports {
            let number = port.number();
            let child = port.child();
            let (mut status, change) = match self.port_status(hub, number) {
                Ok(words) => words,
                Err(err) => {
                    error!(hub = %hub.name(), port = number, error = %err, "activate aborted");
                    return;
                }
            };
            let child_dead = child
                .as_ref()
                .map_or(true, |c| c.state() == DeviceState::NotAttached);

            if child.is_some() || status.contains(PortStatus::CONNECTION) {
                debug!(hub = %hub.name(), port = number, ?status, ?change, "port status");
            }

            // After anything but a plain resume every port starts out disabled.
            if status.contains(PortStatus::ENABLE)
                && (kind != ActivateKind::Resume
                    || !status.contains(PortStatus::CONNECTION)
                    || child_dead)
            {
                status.remove(PortStatus::ENABLE);
                // SuperSpeed ports enable themselves on attach; pretend power was lost instead.
                if !superspeed {
                    let _ = self.clear_port_feature(hub, number, PortFeature::Enable);
                }
            }

            if kind == ActivateKind::Resume && status.warm_reset_required(superspeed) {
                hub.event_bits.set(number);
            }

            if change.contains(PortChange::CONNECTION) {
                need_debounce_delay = true;
                let _ = self.clear_port_feature(hub, number, PortFeature::CConnection);
            }
            if change.contains(PortChange::ENABLE) {
                need_debounce_delay = true;
                let _ = self.clear_port_feature(hub, number, PortFeature::CEnable);
            }
            if change.contains(PortChange::RESET) {
                need_debounce_delay = true;
                let _ = self.clear_port_feature(hub, number, PortFeature::CReset);
            }
            if superspeed && change.contains(PortChange::BH_RESET) {
                need_debounce_delay = true;
                let _ = self.clear_port_feature(hub, number, PortFeature::CBhReset);
            }

            if !status.contains(PortStatus::CONNECTION) || change.contains(PortChange::CONNECTION) {
                hub.removed_bits.clear(number);
            }

            if child_dead {
                if child.is_some()
                    || status.contains(PortStatus::CONNECTION)
                    || status.contains(PortStatus::OVER_CURRENT)
                    || change.contains(PortChange::OVER_CURRENT)
                {
                    hub.change_bits.set(number);
                }
            } else if let Some(child) = &child {
                if status.contains(PortStatus::ENABLE) {
                    // The power session survived; let the dispatcher look at any change.
                    let resumed = status.link_state() == LinkState::U0;
                    if !change.is_empty() || (superspeed && resumed) {
                        hub.event_bits.set(number);
                    }
                } else if child.inner().persist_enabled {
                    child.inner().reset_resume = true;
                    if port.power_is_on() {
                        hub.change_bits.set(number);
                    }
                } else {
                    let _tree = self.lock_tree();
                    set_state_locked(child, DeviceState::NotAttached);
                    hub.change_bits.set(number);
                }
            }
        }

        if need_debounce_delay {
            let delay = ms(DEBOUNCE_STABLE_MS);
            if kind == ActivateKind::Init2 {
                self.queue.schedule(
                    hub,
                    Deferred::Activate(ActivateKind::Init3),
                    self.clock.now() + delay,
                );
                return;
            }
            self.sleep(delay);
        }
        self.activate_finish(hub);
    }

    fn activate_finish(&self, hub: &Arc<Hub>) {
        let Some(hdev) = hub.hdev() else {
            return;
        };
        hub.quiescing.store(false, Ordering::Release);
        if let Err(err) = hdev.controller.submit_status_read(&hdev) {
            error!(hub = %hub.name(), error = %err, "activate: status read submit failed");
        }
        if hub.has_indicators() && self.config.blinkenlights {
            self.queue
                .schedule(hub, Deferred::Leds, self.clock.now() + LED_CYCLE_PERIOD);
        }
        self.kick(hub);
    }

    pub(crate) fn quiesce(&self, hub: &Arc<Hub>, kind: QuiesceKind) {
        hub.quiescing.store(true, Ordering::Release);
        self.queue
            .cancel(hub, |work| matches!(work, Deferred::Activate(_) | Deferred::Leds));

        if kind != QuiesceKind::Suspend {
            for port in &hub.ports {
                self.disconnect_port(hub, port.number());
            }
        }

        if let Some(hdev) = hub.hdev() {
            hdev.controller.cancel_status_read(&hdev);
        }
        if hub.tt.is_some() {
            self.queue.cancel(hub, |work| work == Deferred::TtClear);
            self.tt_work(hub);
        }
    }
}
