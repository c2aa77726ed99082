//! Device enumeration: addressing, descriptor reads and re-verification after a reset.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::clock::ms;
use crate::descriptor::{
    Bos, ConfigDescriptor, DeviceDescriptor, DevicePrefix, BOS_HEADER_LEN, CONFIG_HEADER_LEN,
    DEVICE_DESCRIPTOR_LEN, DEVICE_QUALIFIER_LEN,
};
use crate::device::{Device, DeviceState, TtLink};
use crate::engine::HubEngine;
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::indicator::IndicatorMode;
use crate::request::{SetupPacket, DT_BOS, DT_CONFIG, DT_DEVICE, DT_DEVICE_QUALIFIER, DT_STRING};
use crate::reset::{
    BH_RESET_TIME_MS, LONG_RESET_TIME_MS, ROOT_RESET_TIME_MS, SHORT_RESET_TIME_MS,
};
use crate::status::Speed;

/// Address 0 is shared by every device being enumerated on a bus.
static ADDRESS0_LOCK: Mutex<()> = Mutex::new(());

const SET_ADDRESS_TRIES: usize = 2;
const GET_DESCRIPTOR_TRIES: usize = 2;
const DESCRIPTOR_PROBE_TRIES: usize = 3;
const DESCRIPTOR_PROBE_LEN: u16 = 64;
const SET_ADDRESS_SETTLE_MS: u64 = 10;
const SET_ADDRESS_RETRY_MS: u64 = 200;
const DESCRIPTOR_RETRY_MS: u64 = 100;
const LANG_EN_US: u16 = 0x0409;
const MAX_STRING_LEN: u16 = 255;

/// Progress of one enumeration attempt, reported when the attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumStage {
    Idle,
    Resetting,
    SpeedDetected,
    AddressAssigned,
    DescriptorRead,
    BosQueried,
    Done,
    Failed,
}

impl HubEngine {
    /// Attempts per connection, two for each enumeration scheme in use.
    pub(crate) fn set_config_tries(&self) -> usize {
        2 * (usize::from(self.config.use_both_schemes) + 1)
    }

    fn use_new_scheme(&self, retry_counter: usize) -> bool {
        retry_counter / 2 == usize::from(self.config.old_scheme_first)
    }

    /// Resets the port, assigns `udev` its address and reads its device descriptor (and BOS).
    ///
    /// On failure the port is disabled and the device keeps the address it was given so that
    /// disconnect processing can release it.
    pub fn port_init(
        &self,
        hub: &Arc<Hub>,
        port: u8,
        udev: &Device,
        retry_counter: usize,
    ) -> Result<()> {
        let hdev = hub.require_hdev()?;

        let mut delay = ms(SHORT_RESET_TIME_MS);
        if hdev.is_root_hub() {
            delay = ms(ROOT_RESET_TIME_MS);
        }
        // Some low-speed devices need a longer reset pulse.
        if udev.speed() == Speed::Low {
            delay = ms(LONG_RESET_TIME_MS);
        }

        let _address0 = ADDRESS0_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let devnum = udev.devnum();
        let mut stage = EnumStage::Idle;
        let result = self.port_init_stages(hub, &hdev, port, udev, devnum, retry_counter, delay, &mut stage);
        match &result {
            Ok(()) => {
                debug!(device = %udev.name(), stage = ?EnumStage::Done, "port init complete");
            }
            Err(err) => {
                debug!(device = %udev.name(), stage = ?stage, next = ?EnumStage::Failed, error = %err, "port init failed");
                let _ = self.port_disable(hub, port, false);
                udev.inner().devnum = devnum;
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn port_init_stages(
        &self,
        hub: &Arc<Hub>,
        hdev: &Device,
        port: u8,
        udev: &Device,
        devnum: u8,
        retry_counter: usize,
        delay: std::time::Duration,
        stage: &mut EnumStage,
    ) -> Result<()> {
        let caps = udev.capabilities();

        *stage = EnumStage::Resetting;
        let speed = self.port_reset(hub, port, Some(udev), delay, false)?;
        *stage = EnumStage::SpeedDetected;

        let ep0 = match speed {
            Speed::Super => 512,
            Speed::High | Speed::Full => 64,
            Speed::Low => 8,
            Speed::Unknown => return Err(HubError::ProtocolMismatch("unknown device speed")),
        };
        let reset = udev.active_config().is_some();
        udev.inner().ep0_maxpacket = ep0;
        if speed != Speed::Super {
            info!(
                device = %udev.name(),
                ?speed,
                devnum,
                "{} USB device",
                if reset { "reset" } else { "new" }
            );
        }

        let parent_tt = hdev.inner().tt.clone();
        if let Some(tt) = parent_tt {
            udev.inner().tt = Some(tt);
        } else if speed != Speed::High && hdev.speed() == Speed::High {
            if hub.tt().is_none() {
                error!(device = %udev.name(), "parent hub has no TT");
                return Err(HubError::Invalid("parent hub has no TT"));
            }
            udev.inner().tt = Some(TtLink {
                hub: Arc::downgrade(hub),
                port,
            });
        }

        let new_scheme = self.use_new_scheme(retry_counter) && !caps.usb3_host;
        let mut prefix: Option<DevicePrefix> = None;
        let mut outcome = Err(HubError::ProtocolMismatch("device descriptor read"));

        for attempt in 0..GET_DESCRIPTOR_TRIES {
            if attempt > 0 {
                self.sleep(ms(DESCRIPTOR_RETRY_MS));
            }

            if new_scheme {
                let probe = self.probe_device_descriptor(udev);
                if let Ok(p) = &probe {
                    prefix = Some(*p);
                }
                self.port_reset(hub, port, Some(udev), delay, false)?;
                if let Err(err) = probe {
                    if !err.is_no_device() {
                        error!(device = %udev.name(), error = %err, "device descriptor read/64 failed");
                    }
                    outcome = Err(HubError::ProtocolMismatch("device descriptor read/64"));
                    continue;
                }
            }

            let mut addressed = Err(HubError::Invalid("set address"));
            for _ in 0..SET_ADDRESS_TRIES {
                addressed = self.set_address(udev, devnum, caps.addresses_devices);
                if addressed.is_ok() {
                    break;
                }
                self.sleep(ms(SET_ADDRESS_RETRY_MS));
            }
            if let Err(err) = addressed {
                if !err.is_no_device() {
                    error!(device = %udev.name(), devnum, error = %err, "device not accepting address");
                }
                return Err(err);
            }
            *stage = EnumStage::AddressAssigned;
            if speed == Speed::Super {
                info!(
                    device = %udev.name(),
                    devnum = udev.devnum(),
                    "{} SuperSpeed USB device",
                    if reset { "reset" } else { "new" }
                );
            }
            self.sleep(ms(SET_ADDRESS_SETTLE_MS));
            if new_scheme {
                outcome = Ok(());
                break;
            }

            match self.read_device_prefix(udev) {
                Ok(p) => {
                    prefix = Some(p);
                    outcome = Ok(());
                    break;
                }
                Err(err) => {
                    if !err.is_no_device() {
                        error!(device = %udev.name(), error = %err, "device descriptor read/8 failed");
                    }
                    outcome = Err(err);
                }
            }
        }
        outcome?;
        let prefix = prefix.ok_or(HubError::ProtocolMismatch("no device descriptor"))?;

        if speed == Speed::Super && prefix.bcd_usb < 0x0300 {
            error!(device = %udev.name(), "got a wrong device descriptor, warm reset device");
            let _ = self.port_reset(hub, port, Some(udev), ms(BH_RESET_TIME_MS), true);
            return Err(HubError::ProtocolMismatch("SuperSpeed device below USB 3.0"));
        }

        let want: u16 = if prefix.max_packet_size0 == 0xff || speed == Speed::Super {
            512
        } else {
            u16::from(prefix.max_packet_size0)
        };
        if ep0 != want {
            if speed == Speed::Low || !matches!(want, 8 | 16 | 32 | 64) {
                error!(device = %udev.name(), maxpacket = want, "invalid ep0 maxpacket");
                return Err(HubError::ProtocolMismatch("invalid ep0 maxpacket"));
            }
            if speed == Speed::Full {
                debug!(device = %udev.name(), maxpacket = want, "ep0 maxpacket");
            } else {
                warn!(device = %udev.name(), maxpacket = want, "using ep0 maxpacket");
            }
            udev.inner().ep0_maxpacket = want;
            udev.controller.update_device(udev);
        }

        self.read_device_descriptor(udev).inspect_err(|err| {
            if !err.is_no_device() {
                error!(device = %udev.name(), error = %err, "device descriptor read/all failed");
            }
        })?;
        *stage = EnumStage::DescriptorRead;

        let bcd_usb = udev.inner().descriptor.as_ref().map_or(0, |d| d.bcd_usb);
        if bcd_usb >= 0x0201 {
            *stage = EnumStage::BosQueried;
            if let Err(err) = self.read_bos(udev) {
                debug!(device = %udev.name(), error = %err, "BOS read failed");
            }
        }

        udev.controller.update_device(udev);
        Ok(())
    }

    fn set_address(&self, udev: &Device, devnum: u8, controller_assigns: bool) -> Result<()> {
        if !controller_assigns && devnum <= 1 {
            return Err(HubError::Invalid("address reserved"));
        }
        match udev.state() {
            DeviceState::Address => return Ok(()),
            DeviceState::Default => {}
            _ => return Err(HubError::Invalid("device not in default state")),
        }

        if controller_assigns {
            udev.controller.address_device(udev, devnum)?;
        } else {
            udev.control_out(SetupPacket::set_address(devnum), self.config.control_timeout)?;
        }
        udev.inner().devnum = devnum;
        self.set_device_state(udev, DeviceState::Address);
        Ok(())
    }

    /// 64-byte read of the device descriptor at address 0, as Windows does.
    fn probe_device_descriptor(&self, udev: &Device) -> Result<DevicePrefix> {
        let mut last = HubError::ProtocolMismatch("bad device descriptor probe");
        for _ in 0..DESCRIPTOR_PROBE_TRIES {
            match udev.control_in(
                SetupPacket::get_descriptor(DT_DEVICE, 0, 0, DESCRIPTOR_PROBE_LEN),
                self.config.initial_descriptor_timeout,
            ) {
                Ok(buf) => match DevicePrefix::parse(&buf) {
                    Some(prefix)
                        if prefix.descriptor_type == DT_DEVICE
                            && matches!(prefix.max_packet_size0, 8 | 16 | 32 | 64 | 255) =>
                    {
                        return Ok(prefix);
                    }
                    _ => last = HubError::ProtocolMismatch("bad device descriptor probe"),
                },
                Err(err) if err.is_no_device() => return Err(err),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    fn read_device_prefix(&self, udev: &Device) -> Result<DevicePrefix> {
        let buf = udev.control_in(
            SetupPacket::get_descriptor(DT_DEVICE, 0, 0, 8),
            self.config.control_timeout,
        )?;
        DevicePrefix::parse(&buf).ok_or(HubError::ProtocolMismatch("device descriptor read/8"))
    }

    pub(crate) fn read_device_descriptor(&self, udev: &Device) -> Result<()> {
        let buf = udev.control_in(
            SetupPacket::get_descriptor(DT_DEVICE, 0, 0, DEVICE_DESCRIPTOR_LEN as u16),
            self.config.control_timeout,
        )?;
        let descriptor = DeviceDescriptor::parse(&buf)
            .ok_or(HubError::ProtocolMismatch("short device descriptor"))?;
        udev.inner().descriptor = Some(descriptor);
        Ok(())
    }

    /// Reads the BOS of a USB 2.01+ device and derives its link power parameters.
    pub(crate) fn read_bos(&self, udev: &Device) -> Result<()> {
        let bcd_usb = udev.inner().descriptor.as_ref().map_or(0, |d| d.bcd_usb);
        if bcd_usb < 0x0201 {
            return Ok(());
        }

        let header = udev.control_in(
            SetupPacket::get_descriptor(DT_BOS, 0, 0, BOS_HEADER_LEN as u16),
            self.config.control_timeout,
        )?;
        let total = Bos::total_length(&header).ok_or(HubError::ProtocolMismatch("bad BOS header"))?;
        if (total as usize) < BOS_HEADER_LEN {
            return Err(HubError::ProtocolMismatch("bad BOS length"));
        }
        let buf = udev.control_in(
            SetupPacket::get_descriptor(DT_BOS, 0, 0, total),
            self.config.control_timeout,
        )?;
        let bos = Bos::parse(&buf).ok_or(HubError::ProtocolMismatch("malformed BOS"))?;
        udev.inner().bos = Some(bos);

        let capable = self.device_supports_lpm(udev);
        udev.inner().lpm_capable = capable;
        if capable {
            self.set_lpm_parameters(udev);
        }
        Ok(())
    }

    fn read_config(&self, udev: &Device, index: u8) -> Result<ConfigDescriptor> {
        let header = udev.control_in(
            SetupPacket::get_descriptor(DT_CONFIG, index, 0, CONFIG_HEADER_LEN as u16),
            self.config.control_timeout,
        )?;
        let total = ConfigDescriptor::total_length(&header)
            .ok_or(HubError::ProtocolMismatch("bad config header"))?;
        let buf = udev.control_in(
            SetupPacket::get_descriptor(DT_CONFIG, index, 0, total),
            self.config.control_timeout,
        )?;
        ConfigDescriptor::parse(&buf).ok_or(HubError::ProtocolMismatch("malformed config descriptor"))
    }

    fn read_string(&self, udev: &Device, index: u8) -> Option<String> {
        if index == 0 {
            return None;
        }
        let buf = udev
            .control_in(
                SetupPacket::get_descriptor(DT_STRING, index, LANG_EN_US, MAX_STRING_LEN),
                self.config.control_timeout,
            )
            .ok()?;
        crate::descriptor::parse_string(&buf)
    }

    /// Reads the configurations and the serial number of a freshly addressed device.
    fn enumerate_device(&self, udev: &Device) -> Result<()> {
        let (have_configs, count, i_serial) = {
            let inner = udev.inner();
            let desc = inner
                .descriptor
                .as_ref()
                .ok_or(HubError::ProtocolMismatch("no device descriptor"))?;
            (!inner.configs.is_empty(), desc.num_configurations, desc.i_serial)
        };

        if !have_configs {
            let mut configs = Vec::with_capacity(count as usize);
            for index in 0..count {
                let config = self.read_config(udev, index).inspect_err(|err| {
                    if !err.is_no_device() {
                        error!(device = %udev.name(), error = %err, "can't read configurations");
                    }
                })?;
                configs.push(config);
            }
            udev.inner().configs = configs;
        }

        let serial = self.read_string(udev, i_serial);
        udev.inner().serial = serial;
        Ok(())
    }

    /// Finishes enumeration of a linked device: reads its configurations, registers it and, for
    /// hub devices, binds the hub driver.
    pub(crate) fn new_device(&self, udev: &Arc<Device>) -> Result<()> {
        let result = self.enumerate_device(udev).and_then(|()| {
            if let Some(desc) = udev.descriptor() {
                info!(
                    device = %udev.name(),
                    vendor = format_args!("{:04x}", desc.vendor_id),
                    product = format_args!("{:04x}", desc.product_id),
                    bcd_device = format_args!("{:x}.{:02x}", desc.bcd_device >> 8, desc.bcd_device & 0xff),
                    serial = udev.serial().as_deref().unwrap_or(""),
                    "new USB device found"
                );
            }
            self.registry.register_device(udev).map_err(|err| {
                error!(device = %udev.name(), error = %err, "can't register device");
                HubError::from(err)
            })
        });
        if let Err(err) = result {
            self.set_device_state(udev, DeviceState::NotAttached);
            return Err(err);
        }
        udev.inner().registered = true;

        if let Err(err) = self.set_usb2_hw_lpm(udev, true) {
            debug!(device = %udev.name(), error = %err, "USB 2 hardware LPM not enabled");
        }
        self.bind_hub_driver(udev);
        Ok(())
    }

    fn bind_hub_driver(&self, udev: &Arc<Device>) {
        if !self.config.bind_hubs || !udev.is_authorized() {
            return;
        }
        if let Some(owner) = self.device_is_owned(udev) {
            debug!(device = %udev.name(), ?owner, "port is owned, leaving device unconfigured");
            return;
        }
        let value = match udev.inner().configs.first() {
            Some(config) if config.is_hub() => config.value,
            _ => return,
        };
        if let Err(err) = self.set_configuration(udev, value) {
            error!(device = %udev.name(), value, error = %err, "can't set config");
            return;
        }
        if let Err(err) = self.probe_hub(udev) {
            error!(device = %udev.name(), error = %err, "hub probe failed");
        }
    }

    /// Tells a full-speed device that could run at high speed that it is on the wrong hub.
    pub(crate) fn check_highspeed(&self, hub: &Arc<Hub>, udev: &Device, port: u8) {
        let qualifier = udev.control_in(
            SetupPacket::get_descriptor(DT_DEVICE_QUALIFIER, 0, 0, DEVICE_QUALIFIER_LEN as u16),
            self.config.control_timeout,
        );
        if matches!(qualifier, Ok(ref buf) if buf.len() >= DEVICE_QUALIFIER_LEN) {
            info!(device = %udev.name(), "not running at top speed; connect to a high speed hub");
            if hub.has_indicators() {
                self.set_indicator_mode(hub, port, IndicatorMode::GreenBlink);
                self.schedule_leds_now(hub);
            }
        }
    }

    /// Selects configuration `value`, or unconfigures the device for 0.
    pub fn set_configuration(&self, udev: &Device, value: u8) -> Result<()> {
        if udev.state() == DeviceState::NotAttached {
            return Err(HubError::NoDevice);
        }
        if value != 0 && !udev.inner().configs.iter().any(|c| c.value == value) {
            return Err(HubError::Invalid("no such configuration"));
        }

        let had_config = udev.active_config().is_some();
        if had_config {
            self.disable_lpm(udev)?;
        }
        if let Err(err) =
            udev.control_out(SetupPacket::set_configuration(value), self.config.control_timeout)
        {
            if had_config {
                self.enable_lpm(udev);
            }
            return Err(err);
        }

        {
            let mut inner = udev.inner();
            inner.actconfig = (value != 0).then_some(value);
            inner.alt_settings.clear();
        }
        let state = if value == 0 {
            DeviceState::Address
        } else {
            DeviceState::Configured
        };
        self.set_device_state(udev, state);
        if value != 0 {
            self.enable_lpm(udev);
        }
        Ok(())
    }

    pub fn set_interface(&self, udev: &Device, interface: u8, alt: u8) -> Result<()> {
        if udev.state() == DeviceState::NotAttached {
            return Err(HubError::NoDevice);
        }
        let known = udev
            .inner()
            .active_config()
            .is_some_and(|c| c.interface(interface, alt).is_some());
        if !known {
            return Err(HubError::Invalid("no such interface setting"));
        }
        udev.control_out(
            SetupPacket::set_interface(interface, alt),
            self.config.control_timeout,
        )?;
        udev.inner().alt_settings.insert(interface, alt);
        Ok(())
    }

    /// Revokes authorization: the device is unconfigured and stays that way.
    pub fn deauthorize_device(&self, udev: &Device) -> Result<()> {
        let _guard = udev.lock_device();
        if !udev.is_authorized() {
            return Ok(());
        }
        udev.inner().authorized = false;
        self.set_configuration(udev, 0)
    }

    /// Re-authorizes a device and selects its first configuration.
    pub fn authorize_device(&self, udev: &Device) -> Result<()> {
        let _guard = udev.lock_device();
        if udev.is_authorized() {
            return Ok(());
        }
        self.read_device_descriptor(udev).inspect_err(|err| {
            error!(device = %udev.name(), error = %err, "can't re-read device descriptor for authorization");
        })?;
        udev.inner().authorized = true;
        let first = udev.inner().configs.first().map(|c| c.value);
        if let Some(value) = first {
            if let Err(err) = self.set_configuration(udev, value) {
                error!(device = %udev.name(), value, error = %err, "can't set config");
                return Err(err);
            }
        }
        info!(device = %udev.name(), "authorized to connect");
        Ok(())
    }

    /// Compares what the device reports after a reset with what was read at enumeration.
    fn descriptors_changed(&self, udev: &Device, old: &Option<DeviceDescriptor>) -> bool {
        let (current, configs, serial) = {
            let inner = udev.inner();
            (inner.descriptor.clone(), inner.configs.clone(), inner.serial.clone())
        };
        if current != *old {
            return true;
        }

        for (index, config) in configs.iter().enumerate() {
            let len = config.raw.len() as u16;
            let reread = udev.control_in(
                SetupPacket::get_descriptor(DT_CONFIG, index as u8, 0, len),
                self.config.control_timeout,
            );
            match reread {
                Ok(buf) if buf == config.raw => {}
                Ok(_) => {
                    debug!(device = %udev.name(), index, value = config.value, "config changed");
                    return true;
                }
                Err(err) => {
                    debug!(device = %udev.name(), index, error = %err, "config re-read failed");
                    return true;
                }
            }
        }

        if let Some(serial) = serial {
            let i_serial = current.as_ref().map_or(0, |d| d.i_serial);
            if self.read_string(udev, i_serial).as_deref() != Some(serial.as_str()) {
                debug!(device = %udev.name(), "serial string changed");
                return true;
            }
        }
        false
    }

    /// Resets `udev`'s port and checks that the same device came back, restoring its
    /// configuration and alternate settings. The caller holds the device lock.
    ///
    /// If the device cannot be restored its port is logically disconnected, which makes the
    /// dispatcher re-enumerate whatever is attached now.
    pub(crate) fn reset_and_verify(&self, udev: &Arc<Device>) -> Result<()> {
        let state = udev.state();
        if matches!(state, DeviceState::NotAttached | DeviceState::Suspended) {
            debug!(device = %udev.name(), ?state, "device reset not allowed");
            return Err(HubError::Invalid("device reset not allowed in this state"));
        }
        let Some(parent) = udev.parent() else {
            debug!(device = %udev.name(), "reset_and_verify for root hub");
            return Err(HubError::Invalid("root hub cannot be reset"));
        };
        let Some(hub) = parent.hub() else {
            return Err(HubError::NoDevice);
        };
        let port = udev.portnum();
        let old_descriptor = udev.inner().descriptor.clone();

        let restored = self.reset_and_restore(&hub, port, udev, &old_descriptor);
        if restored.is_err() {
            udev.inner().descriptor = old_descriptor;
            self.port_logical_disconnect(&hub, port);
            return Err(HubError::NoDevice);
        }
        self.enable_lpm(udev);
        self.enable_ltm(udev);
        Ok(())
    }

    fn reset_and_restore(
        &self,
        hub: &Arc<Hub>,
        port: u8,
        udev: &Arc<Device>,
        old_descriptor: &Option<DeviceDescriptor>,
    ) -> Result<()> {
        self.disable_lpm(udev).inspect_err(|_| {
            error!(device = %udev.name(), "failed to disable LPM");
        })?;
        self.disable_ltm(udev).inspect_err(|_| {
            error!(device = %udev.name(), "failed to disable LTM");
        })?;

        hub.busy_bits.set(port);
        let mut result = Err(HubError::NoDevice);
        for attempt in 0..self.set_config_tries() {
            result = self.port_init(hub, port, udev, attempt);
            match &result {
                Ok(()) => break,
                Err(err) if err.is_no_device() => break,
                Err(_) => {}
            }
        }
        hub.busy_bits.clear(port);
        result?;

        if self.descriptors_changed(udev, old_descriptor) {
            info!(device = %udev.name(), "device firmware changed");
            return Err(HubError::NoDevice);
        }

        let (actconfig, alts) = {
            let inner = udev.inner();
            (inner.actconfig, inner.alt_settings.clone())
        };
        let Some(value) = actconfig else {
            return Ok(());
        };
        udev.control_out(SetupPacket::set_configuration(value), self.config.control_timeout)
            .inspect_err(|err| {
                error!(device = %udev.name(), value, error = %err, "can't restore configuration");
            })?;
        self.set_device_state(udev, DeviceState::Configured);

        for (interface, alt) in alts {
            if alt == 0 {
                continue;
            }
            udev.control_out(
                SetupPacket::set_interface(interface, alt),
                self.config.control_timeout,
            )
            .inspect_err(|err| {
                error!(device = %udev.name(), interface, alt, error = %err, "failed to restore interface altsetting");
            })?;
        }
        Ok(())
    }

    /// Resets a device and re-verifies it. Hub devices are quiesced around the reset and their
    /// ports re-activated afterwards.
    pub fn reset_device(&self, udev: &Arc<Device>) -> Result<()> {
        let state = udev.state();
        if matches!(state, DeviceState::NotAttached | DeviceState::Suspended) {
            debug!(device = %udev.name(), ?state, "device reset not allowed");
            return Err(HubError::Invalid("device reset not allowed in this state"));
        }
        let _guard = udev.lock_device();
        self.reset_device_locked(udev)
    }

    pub(crate) fn reset_device_locked(&self, udev: &Arc<Device>) -> Result<()> {
        let hub = udev.hub();
        if let Some(hub) = &hub {
            self.hub_pre_reset(hub);
        }
        let result = self.reset_and_verify(udev);
        if let Some(hub) = &hub {
            if udev.state() != DeviceState::NotAttached {
                self.hub_post_reset(hub);
            }
        }
        result
    }

    pub(crate) fn assign_devnum(&self, udev: &Device) -> Result<u8> {
        let bus = udev.bus().ok_or(HubError::NoDevice)?;
        let devnum = bus.choose_devnum()?;
        udev.inner().devnum = devnum;
        Ok(devnum)
    }

    pub(crate) fn release_device_devnum(&self, udev: &Device) {
        let devnum = std::mem::take(&mut udev.inner().devnum);
        if devnum > 0 {
            if let Some(bus) = udev.bus() {
                bus.release_devnum(devnum);
            }
        }
    }
}
