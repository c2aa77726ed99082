//! Port reset (USB 2.0 §11.24.2.13, USB 3.0 §10.16.2.10 for warm reset).

use std::time::Duration;

use tracing::{debug, error};

use crate::clock::ms;
use crate::device::{Device, DeviceState};
use crate::engine::HubEngine;
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::status::{PortChange, PortFeature, PortStatus, Speed};

pub(crate) const PORT_RESET_TRIES: usize = 5;

pub(crate) const ROOT_RESET_TIME_MS: u64 = 50;
pub(crate) const SHORT_RESET_TIME_MS: u64 = 10;
pub(crate) const BH_RESET_TIME_MS: u64 = 50;
pub(crate) const LONG_RESET_TIME_MS: u64 = 200;
const RESET_TIMEOUT_MS: u64 = 800;

/// Reset recovery (TRSTRCY) plus margin for slow devices.
const RESET_RECOVERY_MS: u64 = 10 + 40;

/// Attempts after this many start polling at the long interval.
const SHORT_DELAY_ATTEMPTS: usize = 2;

fn finishes_reset(outcome: &Result<Speed>) -> bool {
    match outcome {
        Ok(_) => true,
        Err(err) => err.is_no_device(),
    }
}

impl HubEngine {
    /// Resets `port` and returns the speed the port reports afterwards.
    ///
    /// A `warm` (BH) reset is only valid on SuperSpeed hubs. When `device` is given, its address
    /// is dropped to 0 and its state follows the outcome (`Default` or `NotAttached`).
    pub fn port_reset(
        &self,
        hub: &Hub,
        port: u8,
        device: Option<&Device>,
        delay: Duration,
        warm: bool,
    ) -> Result<Speed> {
        let superspeed = hub.is_superspeed();
        let mut warm = warm;
        if !superspeed {
            if warm {
                error!(hub = %hub.name(), "only USB3 hubs support warm reset");
                return Err(HubError::Invalid("warm reset on a USB 2.0 hub"));
            }
        } else if !warm {
            let (status, _) = self.port_status(hub, port)?;
            if status.warm_reset_required(true) {
                warm = true;
            }
        }

        let mut delay = delay;
        for attempt in 0..PORT_RESET_TRIES {
            let feature = if warm {
                PortFeature::BhReset
            } else {
                PortFeature::Reset
            };
            let outcome = match self.set_port_feature(hub, port, feature) {
                Err(err) if err.is_no_device() => Err(HubError::NoDevice),
                Err(err) => {
                    error!(hub = %hub.name(), port, warm, error = %err, "cannot reset port");
                    Err(err)
                }
                Ok(()) => {
                    let outcome = self.wait_reset(hub, port, delay, warm);
                    if let Err(err) = &outcome {
                        if !err.is_no_device() {
                            debug!(hub = %hub.name(), port, error = %err, "port_wait_reset failed");
                        }
                    }
                    outcome
                }
            };

            if finishes_reset(&outcome) {
                self.finish_reset(hub, port, device, &outcome);

                if !superspeed {
                    return self.verify_reset_speed(device, outcome);
                }
                let Ok((status, _)) = self.port_status(hub, port) else {
                    return self.verify_reset_speed(device, outcome);
                };
                if !status.warm_reset_required(true) {
                    return self.verify_reset_speed(device, outcome);
                }
                if !warm {
                    debug!(hub = %hub.name(), port, "hot reset failed, warm reset port");
                    warm = true;
                }
            }

            debug!(hub = %hub.name(), port, warm, attempt = attempt + 1, "port not enabled, trying reset again");
            if attempt + 1 >= SHORT_DELAY_ATTEMPTS {
                delay = ms(LONG_RESET_TIME_MS);
            }
        }

        error!(hub = %hub.name(), port, "cannot enable port, maybe the USB cable is bad?");
        Err(HubError::Timeout("port reset"))
    }

    fn wait_reset(&self, hub: &Hub, port: u8, delay: Duration, warm: bool) -> Result<Speed> {
        let mut delay = delay;
        let mut waited = Duration::ZERO;
        let (mut status, mut change) = (PortStatus::empty(), PortChange::empty());

        while waited < ms(RESET_TIMEOUT_MS) {
            self.sleep(delay);
            (status, change) = self.port_status(hub, port)?;
            if !status.contains(PortStatus::RESET) {
                break;
            }
            if waited >= ms(2 * SHORT_RESET_TIME_MS) {
                delay = ms(LONG_RESET_TIME_MS);
            }
            debug!(hub = %hub.name(), port, warm, delay_ms = delay.as_millis() as u64, "port not reset yet, waiting");
            waited += delay;
        }

        let superspeed = hub.is_superspeed();
        if status.contains(PortStatus::RESET) {
            return Err(HubError::Busy);
        }
        if status.warm_reset_required(superspeed) {
            return Err(HubError::NotConnected);
        }
        if !status.contains(PortStatus::CONNECTION) {
            return Err(HubError::NotConnected);
        }
        if !superspeed && change.contains(PortChange::CONNECTION) {
            return Err(HubError::NotConnected);
        }
        if !status.contains(PortStatus::ENABLE) {
            return Err(HubError::Busy);
        }

        Ok(if superspeed {
            Speed::Super
        } else if status.contains(PortStatus::HIGH_SPEED) {
            Speed::High
        } else if status.contains(PortStatus::LOW_SPEED) {
            Speed::Low
        } else {
            Speed::Full
        })
    }

    fn finish_reset(&self, hub: &Hub, port: u8, device: Option<&Device>, outcome: &Result<Speed>) {
        if outcome.is_ok() {
            self.sleep(ms(RESET_RECOVERY_MS));
            if let Some(device) = device {
                device.inner().devnum = 0;
                if let Err(err) = device.controller.reset_device(device) {
                    debug!(device = %device.name(), error = %err, "controller reset_device failed");
                }
            }
        }

        let _ = self.clear_port_feature(hub, port, PortFeature::CReset);
        if hub.is_superspeed() {
            let _ = self.clear_port_feature(hub, port, PortFeature::CBhReset);
            let _ = self.clear_port_feature(hub, port, PortFeature::CLinkState);
            let _ = self.clear_port_feature(hub, port, PortFeature::CConnection);
        }
        if let Some(device) = device {
            let state = if outcome.is_ok() {
                DeviceState::Default
            } else {
                DeviceState::NotAttached
            };
            self.set_device_state(device, state);
        }
    }

    /// A device keeps the speed it was first detected at; a reset that changes it is fatal.
    fn verify_reset_speed(&self, device: Option<&Device>, outcome: Result<Speed>) -> Result<Speed> {
        let speed = outcome?;
        let Some(device) = device else {
            return Ok(speed);
        };
        let mut inner = device.inner();
        if inner.speed == Speed::Unknown {
            inner.speed = speed;
        } else if inner.speed != speed {
            debug!(device = %device.name(), old = ?inner.speed, new = ?speed, "device reset changed speed");
            return Err(HubError::ProtocolMismatch("device reset changed speed"));
        }
        Ok(speed)
    }
}
