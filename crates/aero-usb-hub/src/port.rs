//! Downstream ports and their ownership.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{Device, DeviceState};
use crate::engine::HubEngine;
use crate::error::{HubError, Result};
use crate::hub::Hub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Removable {
    Unknown = 0,
    Removable = 1,
    Fixed = 2,
}

/// Opaque token identifying whoever claimed a port (e.g. a user-space driver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortOwner(pub u64);

#[derive(Debug)]
pub struct Port {
    number: u8,
    child: Mutex<Option<Arc<Device>>>,
    owner: Mutex<Option<PortOwner>>,
    power_is_on: AtomicBool,
    removable: AtomicU8,
}

impl Port {
    pub(crate) fn new(number: u8) -> Self {
        Self {
            number,
            child: Mutex::new(None),
            owner: Mutex::new(None),
            power_is_on: AtomicBool::new(true),
            removable: AtomicU8::new(Removable::Unknown as u8),
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn child(&self) -> Option<Arc<Device>> {
        self.child_slot().clone()
    }

    pub(crate) fn child_slot(&self) -> MutexGuard<'_, Option<Arc<Device>>> {
        self.child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn owner(&self) -> Option<PortOwner> {
        *self.owner_slot()
    }

    fn owner_slot(&self) -> MutexGuard<'_, Option<PortOwner>> {
        self.owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn power_is_on(&self) -> bool {
        self.power_is_on.load(Ordering::Acquire)
    }

    pub fn removable(&self) -> Removable {
        match self.removable.load(Ordering::Acquire) {
            1 => Removable::Removable,
            2 => Removable::Fixed,
            _ => Removable::Unknown,
        }
    }

    pub(crate) fn set_removable(&self, removable: Removable) {
        self.removable.store(removable as u8, Ordering::Release);
    }
}

impl Hub {
    /// 1-based port lookup.
    pub fn port(&self, port: u8) -> Option<&Port> {
        if port == 0 {
            return None;
        }
        self.ports.get(port as usize - 1)
    }
}

impl HubEngine {
    fn owned_port<'a>(&self, hub: &'a Hub, hdev: &Device, port: u8) -> Result<&'a Port> {
        if hdev.state() == DeviceState::NotAttached {
            return Err(HubError::NoDevice);
        }
        hub.port(port).ok_or(HubError::Invalid("port out of range"))
    }

    fn hub_of(&self, hdev: &Device) -> Result<Arc<Hub>> {
        hdev.hub().ok_or(HubError::NoDevice)
    }

    /// Reserves an unconfigured port for `owner`. Devices connected to an owned port are left
    /// alone by the engine's automatic configuration.
    pub fn claim_port(&self, hdev: &Device, port: u8, owner: PortOwner) -> Result<()> {
        let hub = self.hub_of(hdev)?;
        let port = self.owned_port(&hub, hdev, port)?;
        let mut slot = port.owner_slot();
        if slot.is_some() {
            return Err(HubError::Busy);
        }
        *slot = Some(owner);
        Ok(())
    }

    pub fn release_port(&self, hdev: &Device, port: u8, owner: PortOwner) -> Result<()> {
        let hub = self.hub_of(hdev)?;
        let port = self.owned_port(&hub, hdev, port)?;
        let mut slot = port.owner_slot();
        if *slot != Some(owner) {
            return Err(HubError::NotFound);
        }
        *slot = None;
        Ok(())
    }

    /// Drops every claim `owner` holds on `hdev`'s ports.
    pub fn release_all_ports(&self, hdev: &Device, owner: PortOwner) {
        let Some(hub) = hdev.hub() else {
            return;
        };
        for port in &hub.ports {
            let mut slot = port.owner_slot();
            if *slot == Some(owner) {
                *slot = None;
            }
        }
    }

    /// The owner of the port `device` is attached to, if any.
    pub fn device_is_owned(&self, device: &Device) -> Option<PortOwner> {
        if device.state() == DeviceState::NotAttached {
            return None;
        }
        let hub = device.parent()?.hub()?;
        hub.port(device.portnum())?.owner()
    }

    pub fn find_child(&self, hdev: &Device, port: u8) -> Option<Arc<Device>> {
        hdev.hub()?.port(port)?.child()
    }

    /// Marks hard-wired ports as fixed; the platform knows these even when the hub
    /// descriptor does not say so.
    pub fn adjust_device_removable(&self, hdev: &Device, hard_wired_ports: &[u8]) {
        let Some(hub) = hdev.hub() else {
            return;
        };
        for &number in hard_wired_ports {
            if let Some(port) = hub.port(number) {
                port.set_removable(Removable::Fixed);
            }
        }
    }
}
