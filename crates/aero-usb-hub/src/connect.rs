//! Connect-change handling: enumerating new devices and tearing down departed ones.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::descriptor::CLASS_HUB;
use crate::device::{set_state_locked, Device, DeviceState};
use crate::dispatcher::HubPass;
use crate::engine::HubEngine;
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::indicator::IndicatorMode;
use crate::request::{SetupPacket, DEVICE_STATUS_SELF_POWERED};
use crate::status::{PortChange, PortFeature, PortStatus, Speed};

impl HubEngine {
    pub(crate) fn port_connect_change(
        &self,
        pass: &mut HubPass<'_>,
        hub: &Arc<Hub>,
        port: u8,
        mut status: PortStatus,
        change: PortChange,
    ) {
        debug!(hub = %hub.name(), port, ?status, ?change, "port connect change");

        if hub.has_indicators() {
            self.set_indicator_mode(hub, port, IndicatorMode::Auto);
        }

        let child = hub.port(port).and_then(|p| p.child());
        if status.contains(PortStatus::CONNECTION) {
            if let Some(child) = child.as_ref().filter(|c| c.state() != DeviceState::NotAttached) {
                if self.keep_child(child, status).is_ok() {
                    hub.change_bits.clear(port);
                    return;
                }
            }
        }

        if child.is_some() {
            self.disconnect_port(hub, port);
        }
        hub.change_bits.clear(port);
        if !status.contains(PortStatus::CONNECTION) || change.contains(PortChange::CONNECTION) {
            hub.removed_bits.clear(port);
        }

        if change.intersects(PortChange::CONNECTION | PortChange::ENABLE) {
            let debounced = pass.unlocked(hub, port, || self.port_debounce(hub, port, true));
            if hub.is_quiescing() {
                return;
            }
            match debounced {
                Ok(s) => status = s,
                Err(err) => {
                    if !err.is_no_device() {
                        error!(hub = %hub.name(), port, error = %err, "connect-debounce failed");
                    }
                    status.remove(PortStatus::CONNECTION);
                }
            }
        }

        if !status.contains(PortStatus::CONNECTION) || hub.removed_bits.test(port) {
            if hub.is_port_power_switchable() && !status.is_powered(hub.is_superspeed()) {
                let _ = self.set_port_feature(hub, port, PortFeature::Power);
            }
            if status.contains(PortStatus::ENABLE) {
                let _ = self.port_disable(hub, port, true);
            }
            return;
        }

        let Some(hdev) = hub.hdev() else {
            return;
        };
        let mut last = HubError::NotConnected;
        for attempt in 0..self.set_config_tries() {
            let speed = if hub.is_superspeed() {
                Speed::Super
            } else {
                Speed::Unknown
            };
            let udev = Device::new_child(&hdev, port, speed, self.config.persist);
            self.set_device_state(&udev, DeviceState::Powered);
            udev.inner().bus_ma = hub.ma_per_port();

            if let Err(err) = udev.controller.alloc_device(&udev) {
                error!(hub = %hub.name(), port, error = %err, "couldn't allocate usb_device");
                last = err.into();
                break;
            }

            match self.enumerate_port(pass, hub, &hdev, port, &udev, attempt) {
                Ok(()) => {
                    let remaining = self.power_remaining(hub);
                    debug!(hub = %hub.name(), remaining_ma = remaining, "power budget");
                    return;
                }
                Err(err) => {
                    self.release_device_devnum(&udev);
                    udev.controller.free_device(&udev);
                    let fatal = matches!(err, HubError::NotConnected | HubError::ResourceExhausted(_));
                    last = err;
                    if fatal || hub.is_quiescing() {
                        break;
                    }
                }
            }
        }

        if !matches!(last, HubError::NotConnected | HubError::NoDevice) {
            error!(hub = %hub.name(), port, error = %last, "unable to enumerate USB device");
        }
        let _ = self.port_disable(hub, port, true);
    }

    /// Whether a still-connected child can stay: it is enabled, or it is a suspended persist
    /// device that comes back through remote wakeup.
    fn keep_child(&self, child: &Arc<Device>, status: PortStatus) -> Result<()> {
        if status.contains(PortStatus::ENABLE) {
            return Ok(());
        }
        if child.state() == DeviceState::Suspended && child.inner().persist_enabled {
            return self.remote_wakeup(child);
        }
        Err(HubError::NotConnected)
    }

    /// One enumeration attempt of `udev` behind `port`. Failures after `port_init` disable the
    /// port before returning.
    fn enumerate_port(
        &self,
        pass: &mut HubPass<'_>,
        hub: &Arc<Hub>,
        hdev: &Arc<Device>,
        port: u8,
        udev: &Arc<Device>,
        attempt: usize,
    ) -> Result<()> {
        self.assign_devnum(udev)?;

        pass.unlocked(hub, port, || self.port_init(hub, port, udev, attempt))?;
        if hub.is_quiescing() {
            let _ = self.port_disable(hub, port, true);
            return Err(HubError::NotConnected);
        }

        let result = self.check_new_device(hub, port, udev).and_then(|()| {
            if hub.has_indicators() {
                self.set_indicator_mode(hub, port, IndicatorMode::Auto);
            }
            self.link_child(hdev, hub, port, udev)?;
            self.new_device(udev).inspect_err(|_| self.unlink_child(hub, port, udev))
        });
        if result.is_err() {
            let _ = self.port_disable(hub, port, true);
        }
        result
    }

    fn check_new_device(&self, hub: &Arc<Hub>, port: u8, udev: &Device) -> Result<()> {
        let Some(desc) = udev.descriptor() else {
            return Err(HubError::ProtocolMismatch("no device descriptor"));
        };

        // A bus-powered hub can't hand out unit loads from a single one.
        if desc.device_class == CLASS_HUB && udev.bus_ma() <= hub.unit_load() {
            let buf = udev.control_in(SetupPacket::get_device_status(), self.config.control_timeout)?;
            if buf.len() < 2 {
                return Err(HubError::ProtocolMismatch("short device status"));
            }
            let devstat = u16::from_le_bytes([buf[0], buf[1]]);
            if devstat & DEVICE_STATUS_SELF_POWERED == 0 {
                error!(device = %udev.name(), "can't connect bus-powered hub to this port");
                if hub.has_indicators() {
                    self.set_indicator_mode(hub, port, IndicatorMode::AmberBlink);
                    self.schedule_leds_now(hub);
                }
                return Err(HubError::NotConnected);
            }
        }

        if desc.bcd_usb >= 0x0200
            && udev.speed() == Speed::Full
            && self.highspeed_hubs.load(std::sync::atomic::Ordering::Acquire) > 0
        {
            self.check_highspeed(hub, udev, port);
        }
        Ok(())
    }

    fn link_child(&self, hdev: &Device, hub: &Hub, port: u8, udev: &Arc<Device>) -> Result<()> {
        let slot = hub.port(port).ok_or(HubError::Invalid("port out of range"))?;
        let _tree = self.lock_tree();
        if hdev.state() == DeviceState::NotAttached {
            return Err(HubError::NotConnected);
        }
        *slot.child_slot() = Some(udev.clone());
        Ok(())
    }

    fn unlink_child(&self, hub: &Hub, port: u8, udev: &Arc<Device>) {
        let Some(slot) = hub.port(port) else {
            return;
        };
        let _tree = self.lock_tree();
        let mut child = slot.child_slot();
        if child.as_ref().is_some_and(|c| Arc::ptr_eq(c, udev)) {
            *child = None;
        }
    }

    /// Disconnects whatever is attached to `port` and unlinks it.
    pub(crate) fn disconnect_port(&self, hub: &Hub, port: u8) {
        let Some(slot) = hub.port(port) else {
            return;
        };
        let child = {
            let _tree = self.lock_tree();
            let child = slot.child();
            if let Some(child) = &child {
                set_state_locked(child, DeviceState::NotAttached);
            }
            child
        };
        let Some(child) = child else {
            return;
        };
        self.disconnect_device(&child);
        self.unlink_child(hub, port, &child);
    }

    /// Tears `udev` and everything below it down. Runs at most once per device.
    pub(crate) fn disconnect_device(&self, udev: &Arc<Device>) {
        {
            let mut inner = udev.inner();
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
        }
        self.set_device_state(udev, DeviceState::NotAttached);
        info!(device = %udev.name(), devnum = udev.devnum(), "USB disconnect");

        let _guard = udev.lock_device();
        if udev.hub().is_some() {
            self.disconnect_hub(udev);
        }
        let registered = std::mem::take(&mut udev.inner().registered);
        if registered {
            self.registry.unregister_device(udev);
        }
        self.release_device_devnum(udev);
        if udev.parent().is_some() {
            udev.controller.free_device(udev);
        }
    }

    /// Forces `udev` off the bus as if it had been unplugged, and keeps its port from being
    /// re-enumerated until a new connection shows up.
    pub fn remove_device(&self, udev: &Device) -> Result<()> {
        let parent = udev
            .parent()
            .ok_or(HubError::Invalid("root hubs can't be removed"))?;
        let hub = parent.hub().ok_or(HubError::NoDevice)?;
        let port = udev.portnum();
        hub.removed_bits.set(port);
        self.port_logical_disconnect(&hub, port);
        Ok(())
    }
}
