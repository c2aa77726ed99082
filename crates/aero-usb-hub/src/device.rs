//! USB device objects and the device state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::debug;

use crate::descriptor::{Bos, ConfigDescriptor, DeviceDescriptor};
use crate::engine::{Bus, HubEngine};
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::request::SetupPacket;
use crate::status::Speed;
use crate::transport::{HostCapabilities, HostController};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeviceState {
    NotAttached = 0,
    Attached = 1,
    Powered = 2,
    Default = 3,
    Address = 4,
    Configured = 5,
    Suspended = 6,
}

impl DeviceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => DeviceState::Attached,
            2 => DeviceState::Powered,
            3 => DeviceState::Default,
            4 => DeviceState::Address,
            5 => DeviceState::Configured,
            6 => DeviceState::Suspended,
            _ => DeviceState::NotAttached,
        }
    }
}

/// Link power parameters for one of U1/U2, all latencies in ns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LpmParams {
    pub mel: u32,
    pub pel: u32,
    pub sel: u32,
    /// Timeout currently programmed into the parent port, 0 if disabled.
    pub timeout: u16,
}

/// Transaction translator serving a full/low-speed device behind a high-speed hub.
#[derive(Debug, Clone)]
pub(crate) struct TtLink {
    pub(crate) hub: Weak<Hub>,
    pub(crate) port: u8,
}

#[derive(Debug)]
pub(crate) struct DeviceInner {
    pub(crate) devnum: u8,
    pub(crate) speed: Speed,
    pub(crate) bus_ma: u32,
    pub(crate) ep0_maxpacket: u16,
    pub(crate) descriptor: Option<DeviceDescriptor>,
    pub(crate) configs: Vec<ConfigDescriptor>,
    pub(crate) serial: Option<String>,
    pub(crate) bos: Option<Bos>,
    pub(crate) actconfig: Option<u8>,
    pub(crate) alt_settings: BTreeMap<u8, u8>,
    pub(crate) tt: Option<TtLink>,
    pub(crate) u1: LpmParams,
    pub(crate) u2: LpmParams,
    pub(crate) lpm_capable: bool,
    pub(crate) lpm_disable_count: u32,
    pub(crate) usb2_hw_lpm_enabled: bool,
    pub(crate) ltm_enabled: bool,
    /// Remote wakeup requested for the next suspend.
    pub(crate) do_remote_wakeup: bool,
    /// Set from the active configuration when entering `Configured`.
    pub(crate) wakeup_capable: bool,
    pub(crate) reset_resume: bool,
    pub(crate) persist_enabled: bool,
    pub(crate) port_is_suspended: bool,
    pub(crate) authorized: bool,
    /// Suspended by autosuspend rather than by a system sleep.
    pub(crate) auto_suspended: bool,
    pub(crate) registered: bool,
    /// Set once teardown has claimed the device.
    pub(crate) torn_down: bool,
}

impl DeviceInner {
    fn new(speed: Speed, persist: bool) -> Self {
        Self {
            devnum: 0,
            speed,
            bus_ma: 0,
            ep0_maxpacket: 0,
            descriptor: None,
            configs: Vec::new(),
            serial: None,
            bos: None,
            actconfig: None,
            alt_settings: BTreeMap::new(),
            tt: None,
            u1: LpmParams::default(),
            u2: LpmParams::default(),
            lpm_capable: false,
            lpm_disable_count: 1,
            usb2_hw_lpm_enabled: false,
            ltm_enabled: false,
            do_remote_wakeup: false,
            wakeup_capable: false,
            reset_resume: false,
            persist_enabled: persist,
            port_is_suspended: false,
            authorized: true,
            auto_suspended: false,
            registered: false,
            torn_down: false,
        }
    }

    pub(crate) fn active_config(&self) -> Option<&ConfigDescriptor> {
        let value = self.actconfig?;
        self.configs.iter().find(|c| c.value == value)
    }
}

pub struct Device {
    pub(crate) bus: Weak<Bus>,
    pub(crate) controller: Arc<dyn HostController>,
    parent: Option<Weak<Device>>,
    portnum: u8,
    level: u8,
    devpath: String,
    route: Vec<u8>,
    name: String,
    state: AtomicU8,
    lock: Mutex<()>,
    pub(crate) inner: Mutex<DeviceInner>,
    pub(crate) hub: Mutex<Option<Arc<Hub>>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn new_root(bus: &Arc<Bus>, speed: Speed, persist: bool) -> Arc<Self> {
        Arc::new(Self {
            bus: Arc::downgrade(bus),
            controller: bus.controller.clone(),
            parent: None,
            portnum: 0,
            level: 0,
            devpath: "0".to_string(),
            route: Vec::new(),
            name: format!("usb{}", bus.id),
            state: AtomicU8::new(DeviceState::Attached as u8),
            lock: Mutex::new(()),
            inner: Mutex::new(DeviceInner::new(speed, persist)),
            hub: Mutex::new(None),
        })
    }

    pub(crate) fn new_child(parent: &Arc<Device>, port: u8, speed: Speed, persist: bool) -> Arc<Self> {
        let devpath = if parent.parent.is_none() {
            port.to_string()
        } else {
            format!("{}.{}", parent.devpath, port)
        };
        let mut route = parent.route.clone();
        route.push(port);
        let bus_id = parent.bus.upgrade().map(|b| b.id).unwrap_or_default();

        Arc::new(Self {
            bus: parent.bus.clone(),
            controller: parent.controller.clone(),
            parent: Some(Arc::downgrade(parent)),
            portnum: port,
            level: parent.level + 1,
            name: format!("{}-{}", bus_id, devpath),
            devpath,
            route,
            state: AtomicU8::new(DeviceState::Attached as u8),
            lock: Mutex::new(()),
            inner: Mutex::new(DeviceInner::new(speed, persist)),
            hub: Mutex::new(None),
        })
    }

    /// Bus-qualified path such as `1-2.3`, or `usb1` for a root hub.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    /// Port numbers from the root hub down to this device. Empty for a root hub.
    pub fn route(&self) -> &[u8] {
        &self.route
    }

    /// SuperSpeed route string: 4 bits per tier below the root port.
    pub fn route_string(&self) -> u32 {
        self.route
            .iter()
            .skip(1)
            .enumerate()
            .fold(0u32, |acc, (tier, port)| {
                acc | (u32::from((*port).min(15)) << (4 * tier))
            })
    }

    pub fn portnum(&self) -> u8 {
        self.portnum
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn parent(&self) -> Option<Arc<Device>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_root_hub(&self) -> bool {
        self.parent.is_none()
    }

    pub fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.upgrade()
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn store_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn devnum(&self) -> u8 {
        self.inner().devnum
    }

    pub fn speed(&self) -> Speed {
        self.inner().speed
    }

    pub fn hub(&self) -> Option<Arc<Hub>> {
        self.hub
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_hub(&self, hub: Option<Arc<Hub>>) {
        *self
            .hub
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = hub;
    }

    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.inner().descriptor.clone()
    }

    pub fn serial(&self) -> Option<String> {
        self.inner().serial.clone()
    }

    pub fn active_config(&self) -> Option<u8> {
        self.inner().actconfig
    }

    pub fn alt_setting(&self, interface: u8) -> u8 {
        self.inner()
            .alt_settings
            .get(&interface)
            .copied()
            .unwrap_or(0)
    }

    pub fn bus_ma(&self) -> u32 {
        self.inner().bus_ma
    }

    pub fn u1_params(&self) -> LpmParams {
        self.inner().u1
    }

    pub fn u2_params(&self) -> LpmParams {
        self.inner().u2
    }

    pub fn lpm_capable(&self) -> bool {
        self.inner().lpm_capable
    }

    pub fn lpm_disable_count(&self) -> u32 {
        self.inner().lpm_disable_count
    }

    pub fn ltm_enabled(&self) -> bool {
        self.inner().ltm_enabled
    }

    pub fn wakeup_capable(&self) -> bool {
        self.inner().wakeup_capable
    }

    pub fn reset_resume_pending(&self) -> bool {
        self.inner().reset_resume
    }

    pub fn port_is_suspended(&self) -> bool {
        self.inner().port_is_suspended
    }

    pub fn is_authorized(&self) -> bool {
        self.inner().authorized
    }

    /// Requests remote wakeup to be armed on the next suspend.
    pub fn set_remote_wakeup(&self, enabled: bool) {
        self.inner().do_remote_wakeup = enabled;
    }

    pub fn set_persist_enabled(&self, enabled: bool) {
        self.inner().persist_enabled = enabled;
    }

    pub(crate) fn capabilities(&self) -> HostCapabilities {
        match self.bus.upgrade() {
            Some(bus) => bus.caps,
            None => self.controller.capabilities(),
        }
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The per-device lock serializing resets, suspends and hub event passes.
    pub(crate) fn lock_device(&self) -> MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn control(
        &self,
        setup: SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.controller
            .control(self, setup, data, timeout)
            .map_err(HubError::from)
    }

    pub(crate) fn control_out(&self, setup: SetupPacket, timeout: Duration) -> Result<()> {
        self.control(setup, &mut [], timeout).map(|_| ())
    }

    pub(crate) fn control_in(&self, setup: SetupPacket, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; setup.w_length as usize];
        let len = self.control(setup, &mut buf, timeout)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Snapshot of the children currently linked under this device's hub.
    pub fn children(&self) -> Vec<Arc<Device>> {
        match self.hub() {
            Some(hub) => hub.ports.iter().filter_map(|p| p.child()).collect(),
            None => Vec::new(),
        }
    }
}

impl HubEngine {
    /// Moves `device` to `state`. `NotAttached` is terminal and spreads to every descendant.
    pub fn set_device_state(&self, device: &Device, state: DeviceState) {
        let _tree = self.lock_tree();
        set_state_locked(device, state);
    }
}

/// Caller holds the tree lock.
pub(crate) fn set_state_locked(device: &Device, state: DeviceState) {
    let current = device.state();
    if current == DeviceState::NotAttached {
        return;
    }
    if state == DeviceState::NotAttached {
        mark_not_attached(device);
        return;
    }

    if !device.is_root_hub() && current != DeviceState::Suspended && state != DeviceState::Suspended
    {
        let mut inner = device.inner();
        inner.wakeup_capable = state == DeviceState::Configured
            && inner.active_config().is_some_and(|c| c.remote_wakeup());
    }
    if current != state {
        debug!(device = %device.name(), from = ?current, to = ?state, "device state");
    }
    device.store_state(state);
}

fn mark_not_attached(device: &Device) {
    for child in device.children() {
        mark_not_attached(&child);
    }
    if device.state() != DeviceState::NotAttached {
        debug!(device = %device.name(), "device not attached");
        device.store_state(DeviceState::NotAttached);
    }
}
