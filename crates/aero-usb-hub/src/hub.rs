//! Hub objects: probing, configuration and teardown.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error, info, warn};

use crate::activate::{ActivateKind, QuiesceKind};
use crate::bits::PortBits;
use crate::descriptor::{HubDescriptor, OverCurrentProtection, PowerSwitching};
use crate::device::{Device, DeviceState};
use crate::engine::HubEngine;
use crate::error::{HubError, Result};
use crate::indicator::IndicatorMode;
use crate::port::{Port, Removable};
use crate::power;
use crate::request::{SetupPacket, DEVICE_STATUS_SELF_POWERED};
use crate::status::Speed;
use crate::tt::TtClearRequest;

/// Hubs nested deeper than this are refused (USB 2.0 §4.1.1 allows five external tiers).
pub const MAX_TOPO_LEVEL: u8 = 6;

const GET_HUB_DESCRIPTOR_TRIES: usize = 3;
const USB2_HUB_DESCRIPTOR_LEN: u16 = 15;
const SS_HUB_DESCRIPTOR_LEN: u16 = 12;
const MAX_PORTS: u8 = 31;

/// bDeviceProtocol values of hub devices.
const HUB_PR_FS: u8 = 0;
const HUB_PR_HS_SINGLE_TT: u8 = 1;
const HUB_PR_HS_MULTI_TT: u8 = 2;
const HUB_PR_SS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtInfo {
    /// One TT per port rather than one shared by the whole hub.
    pub multi: bool,
    pub think_time_ns: u32,
}

pub struct Hub {
    hdev: Weak<Device>,
    name: String,
    pub(crate) descriptor: HubDescriptor,
    pub(crate) ports: Vec<Port>,

    pub(crate) event_bits: PortBits,
    pub(crate) change_bits: PortBits,
    pub(crate) wakeup_bits: PortBits,
    pub(crate) busy_bits: PortBits,
    pub(crate) removed_bits: PortBits,

    pub(crate) quiescing: AtomicBool,
    pub(crate) disconnected: AtomicBool,
    pub(crate) error: AtomicBool,
    pub(crate) nerrors: AtomicU32,
    pub(crate) limited_power: AtomicBool,
    pub(crate) ma_per_port: AtomicU32,
    /// Queued plus in-flight dispatcher passes.
    pub(crate) pending: AtomicU32,
    quirk_check_port_auto_suspend: AtomicBool,

    pub(crate) status_lock: Mutex<()>,
    pub(crate) tt: Option<TtInfo>,
    pub(crate) tt_clear: Mutex<VecDeque<TtClearRequest>>,
    pub(crate) has_indicators: bool,
    pub(crate) indicators: Mutex<Vec<IndicatorMode>>,
    highspeed: bool,
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.name)
            .field("ports", &self.ports.len())
            .field("quiescing", &self.is_quiescing())
            .finish_non_exhaustive()
    }
}

impl Hub {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hdev(&self) -> Option<Arc<Device>> {
        self.hdev.upgrade()
    }

    pub(crate) fn require_hdev(&self) -> Result<Arc<Device>> {
        self.hdev().ok_or(HubError::NoDevice)
    }

    pub fn num_ports(&self) -> u8 {
        self.ports.len() as u8
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn descriptor(&self) -> &HubDescriptor {
        &self.descriptor
    }

    pub fn is_superspeed(&self) -> bool {
        self.descriptor.superspeed
    }

    pub fn tt(&self) -> Option<TtInfo> {
        self.tt
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub fn limited_power(&self) -> bool {
        self.limited_power.load(Ordering::Acquire)
    }

    pub fn ma_per_port(&self) -> u32 {
        self.ma_per_port.load(Ordering::Acquire)
    }

    pub fn has_pending_work(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    pub fn has_indicators(&self) -> bool {
        self.has_indicators
    }

    pub fn indicator(&self, port: u8) -> Option<IndicatorMode> {
        self.indicators_mut().get(port.checked_sub(1)? as usize).copied()
    }

    pub(crate) fn indicators_mut(&self) -> MutexGuard<'_, Vec<IndicatorMode>> {
        self.indicators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse autosuspend while any port reports a change.
    pub fn set_quirk_check_port_auto_suspend(&self, enabled: bool) {
        self.quirk_check_port_auto_suspend
            .store(enabled, Ordering::Release);
    }

    pub(crate) fn quirk_check_port_auto_suspend(&self) -> bool {
        self.quirk_check_port_auto_suspend.load(Ordering::Acquire)
    }

    /// Power may be switched per port (ganged or individual), so it can be turned back on.
    pub(crate) fn is_port_power_switchable(&self) -> bool {
        self.descriptor.power_switching() != PowerSwitching::None
    }

    pub(crate) fn unit_load(&self) -> u32 {
        power::unit_load(self.is_superspeed())
    }
}

impl HubEngine {
    /// Binds the hub driver to `hdev`: validates the hub interface, reads the hub descriptor
    /// and brings the ports up.
    pub fn probe_hub(&self, hdev: &Arc<Device>) -> Result<Arc<Hub>> {
        if hdev.level() >= MAX_TOPO_LEVEL {
            error!(hub = %hdev.name(), "unsupported bus topology: hub nested too deep");
            return Err(HubError::Invalid("hub nested too deep"));
        }

        let interface = {
            let inner = hdev.inner();
            let alt = inner.alt_settings.get(&0).copied().unwrap_or(0);
            inner
                .active_config()
                .and_then(|c| c.interface(0, alt))
                .cloned()
        };
        let Some(interface) = interface else {
            error!(hub = %hdev.name(), "hub has no active configuration");
            return Err(HubError::Invalid("hub is not configured"));
        };

        // Some hubs report subclass 1 for historical reasons.
        if interface.subclass != 0 && interface.subclass != 1 {
            error!(hub = %hdev.name(), subclass = interface.subclass, "bad descriptor, ignoring hub");
            return Err(HubError::Invalid("bad hub interface subclass"));
        }
        if interface.endpoints.len() != 1 || !interface.endpoints[0].is_interrupt_in() {
            error!(hub = %hdev.name(), "bad descriptor, ignoring hub");
            return Err(HubError::Invalid("hub needs exactly one interrupt-in endpoint"));
        }

        info!(hub = %hdev.name(), "USB hub found");
        match self.configure_hub(hdev) {
            Ok(hub) => Ok(hub),
            Err(err) => {
                error!(hub = %hdev.name(), error = %err, "config failed");
                Err(err)
            }
        }
    }

    fn read_hub_descriptor(&self, hdev: &Device) -> Result<HubDescriptor> {
        let superspeed = hdev.speed().is_superspeed();
        let (len, min) = if superspeed {
            (SS_HUB_DESCRIPTOR_LEN, SS_HUB_DESCRIPTOR_LEN as usize)
        } else {
            (USB2_HUB_DESCRIPTOR_LEN, 7)
        };

        let mut last = HubError::ProtocolMismatch("short hub descriptor");
        for _ in 0..GET_HUB_DESCRIPTOR_TRIES {
            match hdev.control_in(
                SetupPacket::get_hub_descriptor(superspeed, len),
                self.config.control_timeout,
            ) {
                Ok(buf) if buf.len() >= min => {
                    return HubDescriptor::parse(&buf)
                        .ok_or(HubError::ProtocolMismatch("malformed hub descriptor"));
                }
                Ok(_) => last = HubError::ProtocolMismatch("short hub descriptor"),
                Err(err) if err.is_no_device() => return Err(err),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    fn configure_hub(&self, hdev: &Arc<Device>) -> Result<Arc<Hub>> {
        let descriptor = self.read_hub_descriptor(hdev)?;
        if descriptor.num_ports == 0 || descriptor.num_ports > MAX_PORTS {
            return Err(HubError::Invalid("hub port count out of range"));
        }
        let num_ports = descriptor.num_ports;
        debug!(hub = %hdev.name(), ports = num_ports, "hub descriptor");

        if descriptor.is_compound() {
            debug!(hub = %hdev.name(), "part of a compound device");
        }
        debug!(
            hub = %hdev.name(),
            power_switching = ?descriptor.power_switching(),
            over_current = ?descriptor.over_current_protection(),
            "hub characteristics"
        );
        if descriptor.over_current_protection() == OverCurrentProtection::None {
            debug!(hub = %hdev.name(), "no over-current protection");
        }

        let device_protocol = hdev
            .inner()
            .descriptor
            .as_ref()
            .map(|d| d.device_protocol)
            .unwrap_or(HUB_PR_FS);
        let think_time_ns = descriptor.think_time_ns(device_protocol);
        let tt = match device_protocol {
            HUB_PR_FS => None,
            HUB_PR_HS_SINGLE_TT => {
                debug!(hub = %hdev.name(), "single TT");
                Some(TtInfo {
                    multi: false,
                    think_time_ns,
                })
            }
            HUB_PR_HS_MULTI_TT => {
                let multi = match self.set_interface(hdev, 0, 1) {
                    Ok(()) => true,
                    Err(err) => {
                        error!(hub = %hdev.name(), error = %err, "using single TT");
                        false
                    }
                };
                Some(TtInfo {
                    multi,
                    think_time_ns,
                })
            }
            HUB_PR_SS => None,
            other => {
                debug!(hub = %hdev.name(), protocol = other, "unrecognized hub protocol");
                None
            }
        };
        if let Some(tt) = tt {
            debug!(hub = %hdev.name(), think_time_ns = tt.think_time_ns, "TT requires think time");
        }

        let has_indicators = descriptor.has_port_indicators();
        if has_indicators {
            debug!(hub = %hdev.name(), "port indicators are supported");
        }

        let status = hdev.control_in(SetupPacket::get_device_status(), self.config.control_timeout)?;
        if status.len() < 2 {
            error!(hub = %hdev.name(), "unable to get hub status");
            return Err(HubError::ProtocolMismatch("short device status"));
        }
        let self_powered =
            u16::from_le_bytes([status[0], status[1]]) & DEVICE_STATUS_SELF_POWERED != 0;

        let superspeed = descriptor.superspeed;
        let budget = if hdev.is_root_hub() {
            let mut bus_ma = hdev.bus_ma();
            if bus_ma == 0 {
                bus_ma = power::full_load(superspeed) * num_ports as u32;
                hdev.inner().bus_ma = bus_ma;
            }
            power::root_hub_budget(superspeed, bus_ma)
        } else if !self_powered {
            let budget = power::bus_powered_budget(
                superspeed,
                hdev.bus_ma(),
                descriptor.hub_contr_current as u32,
                num_ports,
            );
            if budget.insufficient {
                warn!(hub = %hdev.name(), "insufficient power available to use all downstream ports");
                self.push_power_event(power::PowerEvent::InsufficientPower {
                    hub: hdev.name().to_string(),
                    available_ma: hdev.bus_ma().saturating_sub(descriptor.hub_contr_current as u32),
                    ports: num_ports,
                });
            }
            budget
        } else {
            power::self_powered_budget(superspeed)
        };
        if budget.ma_per_port < power::full_load(superspeed) {
            debug!(hub = %hdev.name(), ma = budget.ma_per_port, "bus power budget for each child");
        }

        let ports: Vec<Port> = (1..=num_ports).map(Port::new).collect();
        if descriptor.is_compound() {
            for port in &ports {
                port.set_removable(if descriptor.port_is_removable(port.number()) {
                    Removable::Removable
                } else {
                    Removable::Fixed
                });
            }
        }

        let mut indicators = vec![IndicatorMode::Auto; num_ports as usize];
        if has_indicators && self.config.blinkenlights {
            indicators[0] = IndicatorMode::Cycle;
        }

        let highspeed = hdev.speed() == Speed::High;
        let hub = Arc::new(Hub {
            hdev: Arc::downgrade(hdev),
            name: hdev.name().to_string(),
            descriptor,
            ports,
            event_bits: PortBits::new(),
            change_bits: PortBits::new(),
            wakeup_bits: PortBits::new(),
            busy_bits: PortBits::new(),
            removed_bits: PortBits::new(),
            quiescing: AtomicBool::new(true),
            disconnected: AtomicBool::new(false),
            error: AtomicBool::new(false),
            nerrors: AtomicU32::new(0),
            limited_power: AtomicBool::new(budget.limited),
            ma_per_port: AtomicU32::new(budget.ma_per_port),
            pending: AtomicU32::new(0),
            quirk_check_port_auto_suspend: AtomicBool::new(false),
            status_lock: Mutex::new(()),
            tt,
            tt_clear: Mutex::new(VecDeque::new()),
            has_indicators,
            indicators: Mutex::new(indicators),
            highspeed,
        });

        let (hub_status, _) = self.hub_status(&hub)?;
        if hub_status.contains(crate::status::HubStatus::LOCAL_POWER) {
            debug!(hub = %hub.name(), "local power source is lost (inactive)");
        } else {
            debug!(hub = %hub.name(), "local power source is good");
        }

        hdev.set_hub(Some(hub.clone()));
        if highspeed {
            self.highspeed_hubs.fetch_add(1, Ordering::AcqRel);
        }
        hdev.controller.update_device(hdev);

        self.activate(&hub, ActivateKind::Init);
        Ok(hub)
    }

    /// Unbinds the hub driver from `hdev`, disconnecting every device below it.
    pub fn disconnect_hub(&self, hdev: &Device) {
        let Some(hub) = hdev.hub() else {
            return;
        };

        self.queue.remove(&hub);
        hub.disconnected.store(true, Ordering::Release);
        hub.error.store(false, Ordering::Release);
        hub.nerrors.store(0, Ordering::Release);

        self.quiesce(&hub, QuiesceKind::Disconnect);

        {
            let _tree = self.lock_tree();
            for port in &hub.ports {
                port.child_slot().take();
            }
        }
        hdev.set_hub(None);
        if hub.highspeed {
            self.highspeed_hubs.fetch_sub(1, Ordering::AcqRel);
        }
        debug!(hub = %hub.name(), "hub disconnected");
    }

    /// Prepares `hub` for a reset of its device: all children are disconnected.
    pub fn hub_pre_reset(&self, hub: &Arc<Hub>) {
        self.quiesce(hub, QuiesceKind::PreReset);
    }

    pub fn hub_post_reset(&self, hub: &Arc<Hub>) {
        self.activate(hub, ActivateKind::PostReset);
    }

    pub(crate) fn hub_device_alive(&self, hub: &Hub) -> Option<Arc<Device>> {
        hub.hdev()
            .filter(|hdev| hdev.state() != DeviceState::NotAttached)
    }
}
