//! Selective suspend and resume (USB 2.0 §7.1.7.6-7, §11.9; USB 3.0 §10.16.2.10 for U3).

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::activate::{ActivateKind, QuiesceKind};
use crate::clock::ms;
use crate::device::{Device, DeviceState};
use crate::engine::{Bus, HubEngine};
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::request::{
    SetupPacket, DEVICE_REMOTE_WAKEUP, DEVICE_STATUS_REMOTE_WAKEUP, FUNC_SUSPEND_LP,
    FUNC_SUSPEND_RW, INTERFACE_STATUS_RW_CAPABLE, INTERFACE_STATUS_RW_ENABLED,
};
use crate::status::{
    LinkState, PortChange, PortFeature, PortStatus, REMOTE_WAKE_MASK_CONNECT,
    REMOTE_WAKE_MASK_DISCONNECT, REMOTE_WAKE_MASK_OVER_CURRENT,
};

/// A device has this long to finish suspending.
const SUSPEND_SETTLE_MS: u64 = 10;
/// Resume signalling (TDRSMDN) plus margin.
const RESUME_SIGNAL_MS: u64 = 25;
/// Resume recovery (TRSMRCY).
const RESUME_RECOVERY_MS: u64 = 10;

fn parent_hub(udev: &Device) -> Result<Arc<Hub>> {
    udev.parent()
        .and_then(|parent| parent.hub())
        .ok_or(HubError::NoDevice)
}

fn port_is_suspended(hub: &Hub, status: PortStatus) -> bool {
    if hub.is_superspeed() {
        status.link_state() == LinkState::U3
    } else {
        status.contains(PortStatus::SUSPEND)
    }
}

/// Devices at or below `udev` that asked to wake the system.
fn wakeup_enabled_descendants(udev: &Device) -> u32 {
    let own = u32::from(udev.inner().do_remote_wakeup);
    own + udev
        .children()
        .iter()
        .map(|child| wakeup_enabled_descendants(child))
        .sum::<u32>()
}

impl HubEngine {
    /// Suspends `udev`'s upstream link. Hub devices stop their own activity first.
    ///
    /// Outside autosuspend (`auto == false`) a failure to suspend the link is logged and
    /// reported as success, as a system sleep transition must not fail.
    pub fn port_suspend(&self, udev: &Arc<Device>, auto: bool) -> Result<()> {
        let _guard = udev.lock_device();
        match udev.state() {
            DeviceState::NotAttached => return Err(HubError::NoDevice),
            DeviceState::Suspended => return Ok(()),
            _ => {}
        }

        let hub = udev.hub();
        if let Some(hub) = &hub {
            self.hub_suspend(hub, auto)?;
        }

        let result = if udev.is_root_hub() {
            self.set_device_state(udev, DeviceState::Suspended);
            Ok(())
        } else {
            self.suspend_link(udev, auto)
        };

        if result.is_err() || udev.state() != DeviceState::Suspended {
            if let Some(hub) = &hub {
                self.hub_resume(hub);
            }
        } else {
            udev.inner().auto_suspended = auto;
        }
        result
    }

    fn suspend_link(&self, udev: &Arc<Device>, auto: bool) -> Result<()> {
        let hub = parent_hub(udev)?;
        let port = udev.portnum();
        let superspeed = hub.is_superspeed();
        let do_remote_wakeup = udev.inner().do_remote_wakeup;

        if do_remote_wakeup {
            let setup = if superspeed {
                SetupPacket::function_suspend(0, FUNC_SUSPEND_RW | FUNC_SUSPEND_LP)
            } else {
                SetupPacket::set_device_feature(DEVICE_REMOTE_WAKEUP)
            };
            if let Err(err) = udev.control_out(setup, self.config.control_timeout) {
                debug!(device = %udev.name(), error = %err, "won't remote wakeup");
                if auto {
                    return Err(err);
                }
            }
        }

        let mut status: Result<()> = Ok(());
        let mut unwind = Unwind::All;

        if udev.inner().usb2_hw_lpm_enabled {
            let _ = self.set_usb2_hw_lpm(udev, false);
        }
        if let Err(err) = self.disable_ltm(udev) {
            error!(device = %udev.name(), error = %err, "failed to disable LTM before suspend");
            status = Err(HubError::ResourceExhausted("LTM disable"));
            if auto {
                unwind = Unwind::FromHwLpm;
            }
        }
        if status.is_ok() || !auto {
            if let Err(err) = self.disable_lpm(udev) {
                error!(device = %udev.name(), error = %err, "failed to disable LPM before suspend");
                status = Err(HubError::ResourceExhausted("LPM disable"));
                if auto {
                    unwind = Unwind::FromLtm;
                }
            }
        }

        let mut really_suspend = true;
        if unwind == Unwind::All {
            status = if superspeed {
                self.set_port_link_state(&hub, port, LinkState::U3)
            } else if auto || wakeup_enabled_descendants(udev) > 0 {
                self.set_port_feature(&hub, port, PortFeature::Suspend)
            } else {
                really_suspend = false;
                Ok(())
            };
        }

        match status {
            Err(err) => {
                debug!(hub = %hub.name(), port, error = %err, "can't suspend port");
                if unwind == Unwind::All {
                    self.enable_lpm(udev);
                }
                if unwind != Unwind::FromHwLpm {
                    self.enable_ltm(udev);
                }
                let _ = self.set_usb2_hw_lpm(udev, true);
                if do_remote_wakeup {
                    let setup = if superspeed {
                        SetupPacket::clear_function_suspend(0)
                    } else {
                        SetupPacket::clear_device_feature(DEVICE_REMOTE_WAKEUP)
                    };
                    let _ = udev.control_out(setup, self.config.control_timeout);
                }
                if auto {
                    return Err(err);
                }
                Ok(())
            }
            Ok(()) => {
                debug!(
                    device = %udev.name(),
                    wakeup = do_remote_wakeup,
                    "usb {}suspend",
                    if auto { "auto-" } else { "" }
                );
                if really_suspend {
                    udev.inner().port_is_suspended = true;
                    self.sleep(ms(SUSPEND_SETTLE_MS));
                }
                self.set_device_state(udev, DeviceState::Suspended);
                Ok(())
            }
        }
    }

    /// Resumes a suspended device. Devices that are not suspended are left alone.
    ///
    /// A device whose port lost its power session is reset and re-verified when persist is
    /// enabled, otherwise its port is logically disconnected.
    pub fn port_resume(&self, udev: &Arc<Device>, auto: bool) -> Result<()> {
        let _guard = udev.lock_device();
        self.port_resume_locked(udev, auto)
    }

    pub(crate) fn port_resume_locked(&self, udev: &Arc<Device>, auto: bool) -> Result<()> {
        match udev.state() {
            DeviceState::NotAttached => return Err(HubError::NoDevice),
            DeviceState::Suspended => {}
            _ => return Ok(()),
        }

        if udev.is_root_hub() {
            let reset_resume = std::mem::take(&mut udev.inner().reset_resume);
            let state = if udev.active_config().is_some() {
                DeviceState::Configured
            } else {
                DeviceState::Address
            };
            self.set_device_state(udev, state);
            self.resume_hub_of(udev, reset_resume);
            return Ok(());
        }

        let hub = parent_hub(udev)?;
        let port = udev.portnum();
        let superspeed = hub.is_superspeed();

        let mut words = self.port_status(&hub, port);
        let already_resumed =
            matches!(words, Ok((status, _)) if !port_is_suspended(&hub, status));
        if !already_resumed {
            hub.busy_bits.set(port);
            let request = if superspeed {
                self.set_port_link_state(&hub, port, LinkState::U0)
            } else {
                self.clear_port_feature(&hub, port, PortFeature::Suspend)
            };
            words = match request {
                Err(err) => {
                    debug!(hub = %hub.name(), port, error = %err, "can't resume port");
                    Err(err)
                }
                Ok(()) => {
                    debug!(device = %udev.name(), "usb {}resume", if auto { "auto-" } else { "" });
                    self.sleep(ms(RESUME_SIGNAL_MS));
                    let words = self.port_status(&hub, port);
                    self.sleep(ms(RESUME_RECOVERY_MS));
                    words
                }
            };
        }

        if let Ok((_, change)) = &words {
            udev.inner().port_is_suspended = false;
            if superspeed {
                if change.contains(PortChange::LINK_STATE) {
                    let _ = self.clear_port_feature(&hub, port, PortFeature::CLinkState);
                }
            } else if change.contains(PortChange::SUSPEND) {
                let _ = self.clear_port_feature(&hub, port, PortFeature::CSuspend);
            }
        }
        hub.busy_bits.clear(port);

        let result = self
            .check_port_resume_type(udev, &hub, port, words)
            .and_then(|()| self.finish_port_resume(udev));
        if let Err(err) = result {
            debug!(device = %udev.name(), error = %err, "can't resume");
            self.port_logical_disconnect(&hub, port);
            return Err(err);
        }

        let _ = self.set_usb2_hw_lpm(udev, true);
        self.enable_ltm(udev);
        self.enable_lpm(udev);

        let reset_resume = {
            let mut inner = udev.inner();
            inner.auto_suspended = false;
            std::mem::take(&mut inner.reset_resume)
        };
        self.resume_hub_of(udev, reset_resume);
        Ok(())
    }

    fn resume_hub_of(&self, udev: &Device, reset_resume: bool) {
        let Some(hub) = udev.hub() else {
            return;
        };
        if reset_resume {
            self.hub_reset_resume(&hub);
        } else {
            self.hub_resume(&hub);
        }
    }

    fn check_port_resume_type(
        &self,
        udev: &Device,
        hub: &Hub,
        port: u8,
        words: Result<(PortStatus, PortChange)>,
    ) -> Result<()> {
        let (status, change) = match words {
            Ok(words) => words,
            Err(err) => {
                debug!(hub = %hub.name(), port, error = %err, "port status after resume");
                return Err(err);
            }
        };

        let result = if port_is_suspended(hub, status)
            || !status.is_powered(hub.is_superspeed())
            || !status.contains(PortStatus::CONNECTION)
        {
            Err(HubError::NoDevice)
        } else if !status.contains(PortStatus::ENABLE) && !udev.inner().reset_resume {
            // The power session is gone. Persist lets us verify the device with a reset.
            let mut inner = udev.inner();
            if inner.persist_enabled {
                inner.reset_resume = true;
                Ok(())
            } else {
                Err(HubError::NoDevice)
            }
        } else {
            Ok(())
        };

        match &result {
            Err(err) => {
                debug!(hub = %hub.name(), port, ?status, ?change, error = %err, "port status after resume");
            }
            Ok(()) if udev.inner().reset_resume => {
                // Late port handoff can leave change bits behind.
                if change.contains(PortChange::CONNECTION) {
                    let _ = self.clear_port_feature(hub, port, PortFeature::CConnection);
                }
                if change.contains(PortChange::ENABLE) {
                    let _ = self.clear_port_feature(hub, port, PortFeature::CEnable);
                }
            }
            Ok(()) => {}
        }
        result
    }

    fn finish_port_resume(&self, udev: &Arc<Device>) -> Result<()> {
        let reset_resume = udev.inner().reset_resume;
        debug!(
            device = %udev.name(),
            "{}",
            if reset_resume { "finish reset-resume" } else { "finish resume" }
        );
        let state = if udev.active_config().is_some() {
            DeviceState::Configured
        } else {
            DeviceState::Address
        };
        self.set_device_state(udev, state);

        let mut status = if reset_resume {
            self.reset_and_verify(udev)
        } else {
            Ok(())
        };
        let mut devstatus = 0u16;
        if status.is_ok() {
            status = self.read_device_status(udev).map(|s| devstatus = s);
            let persist = udev.inner().persist_enabled;
            if status.is_err() && !reset_resume && persist {
                debug!(device = %udev.name(), "retry with reset-resume");
                udev.inner().reset_resume = true;
                status = self
                    .reset_and_verify(udev)
                    .and_then(|()| self.read_device_status(udev))
                    .map(|s| devstatus = s);
            }
        }

        if let Err(err) = status {
            debug!(device = %udev.name(), error = %err, "gone after usb resume?");
            return Err(err);
        }

        if udev.active_config().is_some() && !udev.inner().reset_resume {
            let parent_superspeed = udev
                .parent()
                .and_then(|p| p.hub())
                .is_some_and(|h| h.is_superspeed());
            let cleared = if !parent_superspeed {
                if devstatus & DEVICE_STATUS_REMOTE_WAKEUP != 0 {
                    udev.control_out(
                        SetupPacket::clear_device_feature(DEVICE_REMOTE_WAKEUP),
                        self.config.control_timeout,
                    )
                } else {
                    Ok(())
                }
            } else {
                self.read_status(udev, SetupPacket::get_interface_status(0))
                    .and_then(|intf| {
                        if intf & (INTERFACE_STATUS_RW_CAPABLE | INTERFACE_STATUS_RW_ENABLED) != 0 {
                            udev.control_out(
                                SetupPacket::clear_function_suspend(0),
                                self.config.control_timeout,
                            )
                        } else {
                            Ok(())
                        }
                    })
            };
            if let Err(err) = cleared {
                debug!(device = %udev.name(), error = %err, "disable remote wakeup failed");
            }
        }
        Ok(())
    }

    fn read_status(&self, udev: &Device, setup: SetupPacket) -> Result<u16> {
        let buf = udev.control_in(setup, self.config.control_timeout)?;
        if buf.len() < 2 {
            return Err(HubError::NoDevice);
        }
        Ok(u16::from_le_bytes([buf[0], buf[1]]))
    }

    fn read_device_status(&self, udev: &Device) -> Result<u16> {
        self.read_status(udev, SetupPacket::get_device_status())
    }

    /// Resumes a device that signalled remote wakeup. The caller holds the parent hub's lock.
    pub fn remote_wakeup(&self, udev: &Arc<Device>) -> Result<()> {
        let _guard = udev.lock_device();
        if udev.state() != DeviceState::Suspended {
            debug!(device = %udev.name(), "usb not suspended");
            return Ok(());
        }
        debug!(device = %udev.name(), "usb wakeup-resume");
        self.port_resume_locked(udev, true)
    }

    /// Stops `hub`'s activity ahead of suspending its device.
    ///
    /// Autosuspend is refused while a child is still active or the dispatcher has work for the
    /// hub.
    pub fn hub_suspend(&self, hub: &Arc<Hub>, auto: bool) -> Result<()> {
        let hdev = hub.require_hdev()?;

        let mut wakeup_descendants = 0;
        for port in &hub.ports {
            let Some(child) = port.child() else {
                continue;
            };
            if !matches!(child.state(), DeviceState::Suspended | DeviceState::NotAttached) {
                warn!(hub = %hub.name(), port = port.number(), "port not suspended yet");
                if auto {
                    return Err(HubError::Busy);
                }
            }
            wakeup_descendants += wakeup_enabled_descendants(&child);
        }
        if auto && hub.has_pending_work() {
            debug!(hub = %hub.name(), "hub has pending work, not suspending");
            return Err(HubError::Busy);
        }

        let do_remote_wakeup = hdev.inner().do_remote_wakeup;
        if do_remote_wakeup && hub.quirk_check_port_auto_suspend() && self.ports_changed(hub) {
            if auto {
                return Err(HubError::Busy);
            }
        }

        if hub.is_superspeed() && do_remote_wakeup {
            let mask =
                REMOTE_WAKE_MASK_CONNECT | REMOTE_WAKE_MASK_DISCONNECT | REMOTE_WAKE_MASK_OVER_CURRENT;
            for port in &hub.ports {
                let _ = self.set_remote_wake_mask(hub, port.number(), mask);
            }
        }

        debug!(hub = %hub.name(), wakeup_descendants, "hub suspend");
        self.quiesce(hub, QuiesceKind::Suspend);
        Ok(())
    }

    fn ports_changed(&self, hub: &Hub) -> bool {
        hub.ports.iter().any(|port| {
            matches!(self.port_status(hub, port.number()), Ok((_, change)) if !change.is_empty())
        })
    }

    pub fn hub_resume(&self, hub: &Arc<Hub>) {
        debug!(hub = %hub.name(), "hub resume");
        self.activate(hub, ActivateKind::Resume);
    }

    pub fn hub_reset_resume(&self, hub: &Arc<Hub>) {
        debug!(hub = %hub.name(), "hub reset-resume");
        self.activate(hub, ActivateKind::ResetResume);
    }

    /// The controller lost power or was reset while suspended; its root hub must be
    /// reset-resumed.
    pub fn root_hub_lost_power(&self, bus: &Bus) {
        if let Some(root) = bus.root_hub() {
            warn!(device = %root.name(), "root hub lost power or was reset");
            root.inner().reset_resume = true;
        }
    }
}

/// How far a failed suspend has to roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unwind {
    /// The link request itself failed: re-enable LPM, LTM, hardware LPM, remote wakeup.
    All,
    /// LPM could not be disabled.
    FromLtm,
    /// LTM could not be disabled.
    FromHwLpm,
}
