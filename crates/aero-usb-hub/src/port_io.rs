//! Class requests to a hub: status reads, port features, power and disable.

use std::sync::MutexGuard;
use std::time::Duration;

use tracing::{debug, error};

use crate::clock::ms;
use crate::device::{set_state_locked, DeviceState};
use crate::engine::HubEngine;
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::request::SetupPacket;
use crate::status::{
    decode_status_words, HubChange, HubFeature, HubStatus, LinkState, PortChange, PortFeature,
    PortStatus,
};

/// Minimum wait after switching port power on.
const MIN_POWER_ON_DELAY_MS: u64 = 100;

impl Hub {
    fn lock_status(&self) -> MutexGuard<'_, ()> {
        self.status_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HubEngine {
    fn read_status_words(&self, hub: &Hub, setup: SetupPacket) -> Result<(u16, u16)> {
        let hdev = hub.require_hdev()?;
        let _status = hub.lock_status();

        let mut last = HubError::Timeout("status read");
        for _ in 0..self.config.status_retries.max(1) {
            match hdev.control_in(setup, self.config.control_timeout) {
                Ok(buf) => {
                    return decode_status_words(&buf)
                        .ok_or(HubError::ProtocolMismatch("short status read"));
                }
                Err(err) if err.is_retryable_status() => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    pub fn hub_status(&self, hub: &Hub) -> Result<(HubStatus, HubChange)> {
        let (status, change) = self
            .read_status_words(hub, SetupPacket::get_hub_status())
            .inspect_err(|err| error!(hub = %hub.name(), error = %err, "get_hub_status failed"))?;
        Ok((
            HubStatus::from_bits_retain(status),
            HubChange::from_bits_retain(change),
        ))
    }

    pub fn port_status(&self, hub: &Hub, port: u8) -> Result<(PortStatus, PortChange)> {
        let (status, change) = self
            .read_status_words(hub, SetupPacket::get_port_status(port))
            .inspect_err(|err| {
                if !err.is_no_device() {
                    error!(hub = %hub.name(), port, error = %err, "get_port_status failed");
                }
            })?;
        Ok((
            PortStatus::from_bits_retain(status),
            PortChange::from_bits_retain(change),
        ))
    }

    fn hub_request(&self, hub: &Hub, setup: SetupPacket) -> Result<()> {
        let hdev = hub.require_hdev()?;
        hdev.control_out(setup, self.config.control_timeout)
    }

    pub fn set_port_feature(&self, hub: &Hub, port: u8, feature: PortFeature) -> Result<()> {
        self.hub_request(hub, SetupPacket::set_port_feature(port, feature))
    }

    pub fn clear_port_feature(&self, hub: &Hub, port: u8, feature: PortFeature) -> Result<()> {
        self.hub_request(hub, SetupPacket::clear_port_feature(port, feature))
    }

    pub fn clear_hub_feature(&self, hub: &Hub, feature: HubFeature) -> Result<()> {
        self.hub_request(hub, SetupPacket::clear_hub_feature(feature))
    }

    pub fn set_port_indicator(&self, hub: &Hub, port: u8, selector: u8) -> Result<()> {
        self.hub_request(hub, SetupPacket::set_port_indicator(port, selector))
    }

    pub fn set_port_link_state(&self, hub: &Hub, port: u8, state: LinkState) -> Result<()> {
        self.hub_request(hub, SetupPacket::set_link_state(port, state))
    }

    pub(crate) fn set_port_feature_with(
        &self,
        hub: &Hub,
        port: u8,
        feature: PortFeature,
        high: u16,
    ) -> Result<()> {
        self.hub_request(hub, SetupPacket::set_port_feature_with(port, feature, high))
    }

    pub(crate) fn set_remote_wake_mask(&self, hub: &Hub, port: u8, mask: u16) -> Result<()> {
        self.hub_request(hub, SetupPacket::set_remote_wake_mask(port, mask))
    }

    /// Disables `port`. With `set_state`, the attached device is marked `NotAttached`.
    pub fn port_disable(&self, hub: &Hub, port: u8, set_state: bool) -> Result<()> {
        let alive = self.hub_device_alive(hub).is_some();

        let mut result = Ok(());
        if alive && !hub.has_error() {
            result = if hub.is_superspeed() {
                self.set_port_link_state(hub, port, LinkState::SsDisabled)
            } else {
                self.clear_port_feature(hub, port, PortFeature::Enable)
            };
        }

        if set_state {
            if let Some(child) = hub.port(port).and_then(|p| p.child()) {
                let _tree = self.lock_tree();
                set_state_locked(&child, DeviceState::NotAttached);
            }
        }

        if let Err(err) = &result {
            if !err.is_no_device() {
                error!(hub = %hub.name(), port, error = %err, "cannot disable port");
            }
        }
        result
    }

    /// Disables the port and lets the dispatcher treat it as a disconnect.
    pub fn port_logical_disconnect(&self, hub: &std::sync::Arc<Hub>, port: u8) {
        debug!(hub = %hub.name(), port, "logical disconnect");
        let _ = self.port_disable(hub, port, true);
        hub.change_bits.set(port);
        self.kick(hub);
    }

    /// Turns power on for every port whose power is not switched off on purpose and returns the
    /// power-good delay. With `do_delay` the delay is also slept.
    pub(crate) fn power_on(&self, hub: &Hub, do_delay: bool) -> Duration {
        if hub.is_port_power_switchable() {
            debug!(hub = %hub.name(), "enabling power on all ports");
        } else {
            debug!(hub = %hub.name(), "trying to enable port power on non-switchable hub");
        }
        for port in &hub.ports {
            let result = if port.power_is_on() {
                self.set_port_feature(hub, port.number(), PortFeature::Power)
            } else {
                self.clear_port_feature(hub, port.number(), PortFeature::Power)
            };
            if let Err(err) = result {
                debug!(hub = %hub.name(), port = port.number(), error = %err, "port power request failed");
            }
        }

        let pgood = u64::from(hub.descriptor.pwr_on_2_pwr_good) * 2;
        let delay = ms(pgood.max(MIN_POWER_ON_DELAY_MS));
        if do_delay {
            self.sleep(delay);
        }
        delay
    }
}
