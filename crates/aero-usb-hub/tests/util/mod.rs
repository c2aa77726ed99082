#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use aero_usb_hub::request::{
    DEVICE_REMOTE_WAKEUP, DT_BOS, DT_CONFIG, DT_DEVICE, DT_DEVICE_CAPABILITY, DT_ENDPOINT, DT_HUB,
    DT_INTERFACE, DT_SS_HUB, DT_STRING, REQ_CLEAR_FEATURE, REQ_CLEAR_TT_BUFFER, REQ_GET_DESCRIPTOR,
    REQ_GET_STATUS, REQ_SET_ADDRESS, REQ_SET_CONFIGURATION, REQ_SET_FEATURE, REQ_SET_HUB_DEPTH,
    REQ_SET_INTERFACE, REQ_SET_SEL,
};
use aero_usb_hub::{
    Bus, Clock, Device, DeviceRegistry, DeviceState, HostCapabilities, HostController, Hub,
    HubConfig, HubEngine, LinkState, LpmState, PortChange, PortFeature, PortStatus,
    RegistrationError, SetupPacket, Speed, TransferError, TtClearRequest,
};

const CONNECTION: u16 = PortStatus::CONNECTION.bits();
const ENABLE: u16 = PortStatus::ENABLE.bits();
const SUSPEND: u16 = PortStatus::SUSPEND.bits();
const OVER_CURRENT: u16 = PortStatus::OVER_CURRENT.bits();
const POWER: u16 = PortStatus::POWER.bits();
const SS_POWER: u16 = PortStatus::SS_POWER.bits();
const LOW_SPEED: u16 = PortStatus::LOW_SPEED.bits();
const HIGH_SPEED: u16 = PortStatus::HIGH_SPEED.bits();
const SS_LINK_STATE: u16 = PortStatus::SS_LINK_STATE.bits();

const C_CONNECTION: u16 = PortChange::CONNECTION.bits();
const C_ENABLE: u16 = PortChange::ENABLE.bits();
const C_SUSPEND: u16 = PortChange::SUSPEND.bits();
const C_OVER_CURRENT: u16 = PortChange::OVER_CURRENT.bits();
const C_RESET: u16 = PortChange::RESET.bits();
const C_BH_RESET: u16 = PortChange::BH_RESET.bits();
const C_LINK_STATE: u16 = PortChange::LINK_STATE.bits();
const C_CONFIG_ERROR: u16 = PortChange::CONFIG_ERROR.bits();

const F_ENABLE: u16 = PortFeature::Enable as u16;
const F_SUSPEND: u16 = PortFeature::Suspend as u16;
const F_RESET: u16 = PortFeature::Reset as u16;
const F_LINK_STATE: u16 = PortFeature::LinkState as u16;
const F_POWER: u16 = PortFeature::Power as u16;
const F_C_CONNECTION: u16 = PortFeature::CConnection as u16;
const F_C_ENABLE: u16 = PortFeature::CEnable as u16;
const F_C_SUSPEND: u16 = PortFeature::CSuspend as u16;
const F_C_OVER_CURRENT: u16 = PortFeature::COverCurrent as u16;
const F_C_RESET: u16 = PortFeature::CReset as u16;
const F_INDICATOR: u16 = PortFeature::Indicator as u16;
const F_U1_TIMEOUT: u16 = PortFeature::U1Timeout as u16;
const F_U2_TIMEOUT: u16 = PortFeature::U2Timeout as u16;
const F_C_LINK_STATE: u16 = PortFeature::CLinkState as u16;
const F_C_CONFIG_ERROR: u16 = PortFeature::CConfigError as u16;
const F_BH_RESET: u16 = PortFeature::BhReset as u16;
const F_C_BH_RESET: u16 = PortFeature::CBhReset as u16;

pub const SERIAL_INDEX: u8 = 3;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Virtual time: sleeping advances the clock instantly.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: Mutex<Duration>,
}

impl FakeClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Default)]
pub struct RecordingRegistry {
    registered: Mutex<Vec<String>>,
    unregistered: Mutex<Vec<(String, DeviceState)>>,
    reject: Mutex<Vec<String>>,
}

impl RecordingRegistry {
    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    /// Names with the device state observed at unregistration.
    pub fn unregistered(&self) -> Vec<(String, DeviceState)> {
        self.unregistered.lock().unwrap().clone()
    }

    pub fn reject(&self, name: &str) {
        self.reject.lock().unwrap().push(name.to_string());
    }
}

impl DeviceRegistry for RecordingRegistry {
    fn register_device(&self, device: &Arc<Device>) -> Result<(), RegistrationError> {
        if self.reject.lock().unwrap().iter().any(|n| n == device.name()) {
            return Err(RegistrationError::new("rejected by test"));
        }
        self.registered.lock().unwrap().push(device.name().to_string());
        Ok(())
    }

    fn unregister_device(&self, device: &Arc<Device>) {
        self.unregistered
            .lock()
            .unwrap()
            .push((device.name().to_string(), device.state()));
    }
}

#[derive(Debug, Clone)]
pub struct HubSpec {
    pub ports: u8,
    pub characteristics: u16,
    pub contr_current: u8,
    pub pwr_on_2_pwr_good: u8,
    pub hdr_dec_lat: u8,
}

/// What a simulated device reports about itself.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub speed: Speed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_protocol: u8,
    pub max_packet0: u8,
    pub configs: Vec<Vec<u8>>,
    pub serial: Option<String>,
    pub bos: Option<Vec<u8>>,
    pub self_powered: bool,
    pub hub: Option<HubSpec>,
}

impl DeviceSpec {
    /// A single-configuration vendor device with alternate settings 0 and 1 on interface 0.
    pub fn function(speed: Speed) -> Self {
        let (bcd_usb, max_packet0) = match speed {
            Speed::Super => (0x0300, 9),
            Speed::Low => (0x0110, 8),
            _ => (0x0200, 64),
        };
        Self {
            speed,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_usb,
            device_class: 0,
            device_protocol: 0,
            max_packet0,
            configs: vec![function_config(1, 50)],
            serial: Some("SN0001".to_string()),
            bos: None,
            self_powered: false,
            hub: None,
        }
    }

    /// A self-powered hub; high-speed hubs have a single TT.
    pub fn hub(speed: Speed, ports: u8) -> Self {
        let (bcd_usb, protocol, max_packet0) = match speed {
            Speed::Super => (0x0300, 3, 9),
            Speed::High => (0x0200, 1, 64),
            _ => (0x0110, 0, 64),
        };
        Self {
            speed,
            vendor_id: 0x05e3,
            product_id: 0x0610,
            bcd_usb,
            device_class: 9,
            device_protocol: protocol,
            max_packet0,
            configs: vec![hub_config(false)],
            serial: None,
            bos: None,
            self_powered: true,
            hub: Some(HubSpec {
                ports,
                // Individual port power switching.
                characteristics: 0x0001,
                contr_current: 0,
                pwr_on_2_pwr_good: 50,
                hdr_dec_lat: 0,
            }),
        }
    }

    /// A root hub; high-speed ones have an integrated TT.
    pub fn root_hub(speed: Speed, ports: u8) -> Self {
        let mut spec = Self::hub(speed, ports);
        spec.vendor_id = 0x1d6b;
        spec.product_id = if speed == Speed::Super { 3 } else { 2 };
        spec
    }

    pub fn multi_tt(mut self) -> Self {
        self.device_protocol = 2;
        self.configs = vec![hub_config(true)];
        self
    }

    pub fn bus_powered(mut self, contr_current: u8) -> Self {
        self.self_powered = false;
        if let Some(hub) = self.hub.as_mut() {
            hub.contr_current = contr_current;
        }
        self
    }

    pub fn with_max_power(mut self, units: u8) -> Self {
        self.configs = vec![function_config(1, units)];
        self
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    pub fn with_ss_exit_latencies(mut self, u1_us: u8, u2_us: u16) -> Self {
        self.bos = Some(ss_bos(u1_us, u2_us));
        self
    }

    pub fn device_descriptor(&self) -> Vec<u8> {
        let [bcd_lo, bcd_hi] = self.bcd_usb.to_le_bytes();
        let [vid_lo, vid_hi] = self.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = self.product_id.to_le_bytes();
        vec![
            18,
            DT_DEVICE,
            bcd_lo,
            bcd_hi,
            self.device_class,
            0,
            self.device_protocol,
            self.max_packet0,
            vid_lo,
            vid_hi,
            pid_lo,
            pid_hi,
            0x00,
            0x01,
            0,
            0,
            if self.serial.is_some() { SERIAL_INDEX } else { 0 },
            self.configs.len() as u8,
        ]
    }

    fn hub_descriptor(&self) -> Option<Vec<u8>> {
        let hub = self.hub.as_ref()?;
        let [ch_lo, ch_hi] = hub.characteristics.to_le_bytes();
        if self.speed == Speed::Super {
            return Some(vec![
                12,
                DT_SS_HUB,
                hub.ports,
                ch_lo,
                ch_hi,
                hub.pwr_on_2_pwr_good,
                hub.contr_current,
                hub.hdr_dec_lat,
                0,
                0,
                0,
                0,
            ]);
        }
        let bytes = (hub.ports as usize + 1).div_ceil(8);
        let mut desc = vec![
            (7 + 2 * bytes) as u8,
            DT_HUB,
            hub.ports,
            ch_lo,
            ch_hi,
            hub.pwr_on_2_pwr_good,
            hub.contr_current,
        ];
        desc.extend(std::iter::repeat(0x00).take(bytes));
        desc.extend(std::iter::repeat(0xff).take(bytes));
        Some(desc)
    }
}

fn config(value: u8, attributes: u8, max_power: u8, body: Vec<u8>) -> Vec<u8> {
    let [total_lo, total_hi] = ((9 + body.len()) as u16).to_le_bytes();
    let mut out = vec![9, DT_CONFIG, total_lo, total_hi, 1, value, 0, attributes, max_power];
    out.extend(body);
    out
}

pub fn function_config(value: u8, max_power: u8) -> Vec<u8> {
    let mut body = Vec::new();
    for alt in 0..2u8 {
        body.extend_from_slice(&[9, DT_INTERFACE, 0, alt, 1, 0xff, 0, 0, 0]);
        body.extend_from_slice(&[7, DT_ENDPOINT, 0x81, 0x02, 64, 0, 0]);
    }
    config(value, 0xa0, max_power, body)
}

pub fn hub_config(multi_tt: bool) -> Vec<u8> {
    let mut body = vec![
        9, DT_INTERFACE, 0, 0, 1, 9, 0, 0, 0, //
        7, DT_ENDPOINT, 0x81, 0x03, 1, 0, 12,
    ];
    if multi_tt {
        body.extend_from_slice(&[
            9, DT_INTERFACE, 0, 1, 1, 9, 0, 2, 0, //
            7, DT_ENDPOINT, 0x81, 0x03, 1, 0, 12,
        ]);
    }
    config(1, 0xe0, 50, body)
}

/// A BOS with only the SuperSpeed device capability.
pub fn ss_bos(u1_us: u8, u2_us: u16) -> Vec<u8> {
    let [u2_lo, u2_hi] = u2_us.to_le_bytes();
    vec![
        5, DT_BOS, 15, 0, 1, //
        10, DT_DEVICE_CAPABILITY, 0x03, 0, 0x0e, 0, 1, u1_us, u2_lo, u2_hi,
    ]
}

fn string_descriptor(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut out = vec![(2 + units.len() * 2) as u8, DT_STRING];
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

fn reply(data: &mut [u8], bytes: &[u8]) -> Result<usize, TransferError> {
    let n = data.len().min(bytes.len());
    data[..n].copy_from_slice(&bytes[..n]);
    Ok(n)
}

#[derive(Debug, Default)]
pub struct SimPort {
    pub status: u16,
    pub change: u16,
    pub device: Option<SimDevice>,
    pub reset_failures: u32,
    pub flap_period: Option<Duration>,
    pub indicator: u8,
    pub u1_timeout: u8,
    pub u2_timeout: u8,
}

impl SimPort {
    fn power_bit(superspeed: bool) -> u16 {
        if superspeed {
            SS_POWER
        } else {
            POWER
        }
    }

    fn refresh(&mut self, now: Duration) {
        let Some(period) = self.flap_period else {
            return;
        };
        let connected = (now.as_millis() / period.as_millis()) % 2 == 0;
        if connected != (self.status & CONNECTION != 0) {
            if connected {
                self.status |= CONNECTION;
            } else {
                self.status &= !(CONNECTION | ENABLE);
            }
            self.change |= C_CONNECTION;
        }
    }

    fn reset(&mut self, superspeed: bool, warm: bool) {
        if self.status & CONNECTION == 0 {
            return;
        }
        if self.reset_failures > 0 {
            self.reset_failures -= 1;
            return;
        }
        let Some(device) = self.device.as_mut() else {
            return;
        };
        if superspeed {
            self.status = (self.status & !SS_LINK_STATE) | ENABLE;
        } else {
            let speed = match device.spec.speed {
                Speed::High => HIGH_SPEED,
                Speed::Low => LOW_SPEED,
                _ => 0,
            };
            self.status = (self.status & !(SUSPEND | HIGH_SPEED | LOW_SPEED)) | ENABLE | speed;
        }
        self.change |= if warm { C_BH_RESET } else { C_RESET };
        device.forget();
    }

    fn set_feature(&mut self, feature: u16, high: u16, superspeed: bool) {
        match feature {
            F_RESET => self.reset(superspeed, false),
            F_BH_RESET => self.reset(superspeed, true),
            F_POWER => {
                self.status |= Self::power_bit(superspeed);
                self.status &= !OVER_CURRENT;
            }
            F_SUSPEND => {
                if self.status & ENABLE != 0 {
                    self.status |= SUSPEND;
                }
            }
            F_LINK_STATE => {
                self.status = (self.status & !SS_LINK_STATE) | ((high & 0x0f) << 5);
                if high == LinkState::SsDisabled as u16 {
                    self.status &= !ENABLE;
                } else if high == LinkState::U0 as u16 {
                    self.change |= C_LINK_STATE;
                }
            }
            F_INDICATOR => self.indicator = high as u8,
            F_U1_TIMEOUT => self.u1_timeout = high as u8,
            F_U2_TIMEOUT => self.u2_timeout = high as u8,
            _ => {}
        }
    }

    fn clear_feature(&mut self, feature: u16, superspeed: bool) {
        match feature {
            F_ENABLE => self.status &= !ENABLE,
            F_SUSPEND => {
                if self.status & SUSPEND != 0 {
                    self.status &= !SUSPEND;
                    self.change |= C_SUSPEND;
                }
            }
            F_POWER => self.status &= !(Self::power_bit(superspeed) | ENABLE),
            F_C_CONNECTION => self.change &= !C_CONNECTION,
            F_C_ENABLE => self.change &= !C_ENABLE,
            F_C_SUSPEND => self.change &= !C_SUSPEND,
            F_C_OVER_CURRENT => self.change &= !C_OVER_CURRENT,
            F_C_RESET => self.change &= !C_RESET,
            F_C_BH_RESET => self.change &= !C_BH_RESET,
            F_C_LINK_STATE => self.change &= !C_LINK_STATE,
            F_C_CONFIG_ERROR => self.change &= !C_CONFIG_ERROR,
            _ => {}
        }
    }
}

#[derive(Debug)]
pub struct SimDevice {
    pub spec: DeviceSpec,
    pub address: u8,
    pub config: u8,
    pub alts: BTreeMap<u8, u8>,
    pub remote_wakeup: bool,
    pub hub_status: u16,
    pub hub_change: u16,
    pub ports: Vec<SimPort>,
}

impl SimDevice {
    pub fn new(spec: DeviceSpec) -> Self {
        let ports = spec.hub.as_ref().map_or(0, |h| h.ports);
        Self {
            spec,
            address: 0,
            config: 0,
            alts: BTreeMap::new(),
            remote_wakeup: false,
            hub_status: 0,
            hub_change: 0,
            ports: (0..ports).map(|_| SimPort::default()).collect(),
        }
    }

    fn superspeed(&self) -> bool {
        self.spec.speed == Speed::Super
    }

    /// A bus reset returns the device to its default state.
    fn forget(&mut self) {
        self.address = 0;
        self.config = 0;
        self.alts.clear();
        self.remote_wakeup = false;
    }

    pub fn port_mut(&mut self, port: u8) -> Option<&mut SimPort> {
        let index = port.checked_sub(1)?;
        self.ports.get_mut(index as usize)
    }

    fn handle(
        &mut self,
        setup: SetupPacket,
        data: &mut [u8],
        now: Duration,
    ) -> Result<usize, TransferError> {
        let class = setup.bm_request_type & 0x60 == 0x20;
        let recipient = setup.bm_request_type & 0x1f;
        match (class, recipient) {
            (true, 0) => self.hub_request(setup, data),
            (true, 3) => self.port_request(setup, data, now),
            (true, _) => Err(TransferError::Stall),
            (false, _) => self.standard_request(setup, data, recipient),
        }
    }

    fn hub_request(&mut self, setup: SetupPacket, data: &mut [u8]) -> Result<usize, TransferError> {
        if self.spec.hub.is_none() {
            return Err(TransferError::Stall);
        }
        match setup.b_request {
            REQ_GET_STATUS => {
                let [s0, s1] = self.hub_status.to_le_bytes();
                let [c0, c1] = self.hub_change.to_le_bytes();
                reply(data, &[s0, s1, c0, c1])
            }
            REQ_GET_DESCRIPTOR => {
                let desc = self.spec.hub_descriptor().ok_or(TransferError::Stall)?;
                reply(data, &desc)
            }
            REQ_CLEAR_FEATURE => {
                self.hub_change &= !1u16.checked_shl(u32::from(setup.w_value)).unwrap_or(0);
                Ok(0)
            }
            REQ_SET_HUB_DEPTH => Ok(0),
            _ => Err(TransferError::Stall),
        }
    }

    fn port_request(
        &mut self,
        setup: SetupPacket,
        data: &mut [u8],
        now: Duration,
    ) -> Result<usize, TransferError> {
        if setup.b_request == REQ_CLEAR_TT_BUFFER {
            return Ok(0);
        }
        let superspeed = self.superspeed();
        let number = (setup.w_index & 0xff) as u8;
        let high = setup.w_index >> 8;
        let port = self.port_mut(number).ok_or(TransferError::Stall)?;
        match setup.b_request {
            REQ_GET_STATUS => {
                port.refresh(now);
                let [s0, s1] = port.status.to_le_bytes();
                let [c0, c1] = port.change.to_le_bytes();
                reply(data, &[s0, s1, c0, c1])
            }
            REQ_SET_FEATURE => {
                port.set_feature(setup.w_value, high, superspeed);
                Ok(0)
            }
            REQ_CLEAR_FEATURE => {
                port.clear_feature(setup.w_value, superspeed);
                Ok(0)
            }
            _ => Err(TransferError::Stall),
        }
    }

    fn standard_request(
        &mut self,
        setup: SetupPacket,
        data: &mut [u8],
        recipient: u8,
    ) -> Result<usize, TransferError> {
        match (setup.b_request, recipient) {
            (REQ_GET_DESCRIPTOR, _) => self.descriptor(setup, data),
            (REQ_GET_STATUS, 0) => {
                let status =
                    u8::from(self.spec.self_powered) | (u8::from(self.remote_wakeup) << 1);
                reply(data, &[status, 0])
            }
            (REQ_GET_STATUS, _) => reply(data, &[0, 0]),
            (REQ_SET_ADDRESS, _) => {
                self.address = setup.w_value as u8;
                Ok(0)
            }
            (REQ_SET_CONFIGURATION, _) => {
                let value = setup.w_value as u8;
                if value != 0 && !self.spec.configs.iter().any(|c| c[5] == value) {
                    return Err(TransferError::Stall);
                }
                self.config = value;
                self.alts.clear();
                Ok(0)
            }
            (REQ_SET_INTERFACE, _) => {
                self.alts.insert(setup.w_index as u8, setup.w_value as u8);
                Ok(0)
            }
            (REQ_SET_FEATURE, 0) if setup.w_value == DEVICE_REMOTE_WAKEUP => {
                self.remote_wakeup = true;
                Ok(0)
            }
            (REQ_CLEAR_FEATURE, 0) if setup.w_value == DEVICE_REMOTE_WAKEUP => {
                self.remote_wakeup = false;
                Ok(0)
            }
            (REQ_SET_FEATURE | REQ_CLEAR_FEATURE, _) => Ok(0),
            (REQ_SET_SEL, _) => Ok(data.len()),
            _ => Err(TransferError::Stall),
        }
    }

    fn descriptor(&self, setup: SetupPacket, data: &mut [u8]) -> Result<usize, TransferError> {
        let ty = (setup.w_value >> 8) as u8;
        let index = setup.w_value as u8;
        let bytes = match ty {
            DT_DEVICE => self.spec.device_descriptor(),
            DT_CONFIG => self
                .spec
                .configs
                .get(index as usize)
                .cloned()
                .ok_or(TransferError::Stall)?,
            DT_STRING => match (index, &self.spec.serial) {
                (0, _) => vec![4, DT_STRING, 0x09, 0x04],
                (SERIAL_INDEX, Some(serial)) => string_descriptor(serial),
                _ => return Err(TransferError::Stall),
            },
            DT_BOS => self.spec.bos.clone().ok_or(TransferError::Stall)?,
            _ => return Err(TransferError::Stall),
        };
        reply(data, &bytes)
    }
}

/// One control transfer seen by the simulated controller.
#[derive(Debug, Clone)]
pub struct Request {
    pub device: String,
    pub route: Vec<u8>,
    pub setup: SetupPacket,
    /// OUT data stage, empty for IN transfers.
    pub data: Vec<u8>,
}

impl Request {
    pub fn is_port_feature(&self, request: u8, port: u8, feature: PortFeature) -> bool {
        self.setup.bm_request_type == 0x23
            && self.setup.b_request == request
            && self.setup.w_value == feature.selector()
            && (self.setup.w_index & 0xff) == u16::from(port)
    }
}

#[derive(Debug)]
struct SimState {
    root: SimDevice,
    log: Vec<Request>,
    status_reads: usize,
    cancelled_reads: usize,
    freed: Vec<String>,
    tt_completions: Vec<u8>,
    lpm_timeouts: (u16, u16),
}

/// Walks `route` from the root hub the way the bus would: every port on the way must be
/// connected and enabled.
fn reachable<'a>(root: &'a mut SimDevice, route: &[u8]) -> Result<&'a mut SimDevice, TransferError> {
    let mut node = root;
    for &number in route {
        let port = node.port_mut(number).ok_or(TransferError::NoDevice)?;
        if port.status & CONNECTION == 0 {
            return Err(TransferError::NoDevice);
        }
        if port.status & ENABLE == 0 {
            return Err(TransferError::Timeout);
        }
        node = port.device.as_mut().ok_or(TransferError::NoDevice)?;
    }
    Ok(node)
}

fn walk<'a>(root: &'a mut SimDevice, route: &[u8]) -> Option<&'a mut SimDevice> {
    let mut node = root;
    for &number in route {
        node = node.port_mut(number)?.device.as_mut()?;
    }
    Some(node)
}

/// A host controller whose topology is a tree of simulated hubs and devices.
pub struct SimBus {
    caps: HostCapabilities,
    clock: Arc<FakeClock>,
    state: Mutex<SimState>,
}

impl SimBus {
    pub fn new(caps: HostCapabilities, clock: Arc<FakeClock>, root: DeviceSpec) -> Arc<Self> {
        Arc::new(Self {
            caps,
            clock,
            state: Mutex::new(SimState {
                root: SimDevice::new(root),
                log: Vec::new(),
                status_reads: 0,
                cancelled_reads: 0,
                freed: Vec::new(),
                tt_completions: Vec::new(),
                lpm_timeouts: (0, 0),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn with_port<T>(&self, route: &[u8], port: u8, f: impl FnOnce(&mut SimPort) -> T) -> T {
        self.with_hub_port(route, port, |p, _| f(p))
    }

    /// Like `with_port`, also passing whether the hub is a SuperSpeed hub.
    fn with_hub_port<T>(
        &self,
        route: &[u8],
        port: u8,
        f: impl FnOnce(&mut SimPort, bool) -> T,
    ) -> T {
        let mut state = self.state();
        let hub = walk(&mut state.root, route).expect("no simulated hub at route");
        let superspeed = hub.superspeed();
        let port = hub.port_mut(port).expect("no such simulated port");
        f(port, superspeed)
    }

    pub fn with_device<T>(&self, route: &[u8], f: impl FnOnce(&mut SimDevice) -> T) -> T {
        let mut state = self.state();
        let device = walk(&mut state.root, route).expect("no simulated device at route");
        f(device)
    }

    pub fn plug(&self, route: &[u8], port: u8, spec: DeviceSpec) {
        self.with_port(route, port, |p| {
            p.device = Some(SimDevice::new(spec));
            p.status |= CONNECTION;
            p.change |= C_CONNECTION;
        });
    }

    pub fn unplug(&self, route: &[u8], port: u8) {
        self.with_hub_port(route, port, |p, superspeed| {
            p.device = None;
            p.flap_period = None;
            p.status &= if superspeed {
                !(CONNECTION | ENABLE | SS_LINK_STATE)
            } else {
                !(CONNECTION | ENABLE | SUSPEND | HIGH_SPEED | LOW_SPEED)
            };
            p.change |= C_CONNECTION;
        });
    }

    /// Makes the next `count` resets of the port leave it disabled.
    pub fn set_reset_failures(&self, route: &[u8], port: u8, count: u32) {
        self.with_port(route, port, |p| p.reset_failures = count);
    }

    /// Toggles the connection every `period` of virtual time.
    pub fn flap(&self, route: &[u8], port: u8, period: Duration) {
        self.with_port(route, port, |p| p.flap_period = Some(period));
    }

    pub fn over_current(&self, route: &[u8], port: u8) {
        self.with_hub_port(route, port, |p, superspeed| {
            p.status |= OVER_CURRENT;
            p.status &= !(SimPort::power_bit(superspeed) | ENABLE);
            p.change |= C_OVER_CURRENT;
        });
    }

    /// The port drops its enable and the device loses its configuration, as after a
    /// suspend-time power loss.
    pub fn lose_power_session(&self, route: &[u8], port: u8) {
        self.with_hub_port(route, port, |p, superspeed| {
            p.status &= if superspeed {
                !(ENABLE | SS_LINK_STATE)
            } else {
                !(ENABLE | SUSPEND)
            };
            p.change |= C_ENABLE;
            if let Some(device) = p.device.as_mut() {
                device.forget();
            }
        });
    }

    /// The device on the port signals resume.
    pub fn signal_resume(&self, route: &[u8], port: u8) {
        self.with_port(route, port, |p| {
            p.status &= !SUSPEND;
            p.change |= C_SUSPEND;
        });
    }

    pub fn port_words(&self, route: &[u8], port: u8) -> (PortStatus, PortChange) {
        self.with_port(route, port, |p| {
            (
                PortStatus::from_bits_retain(p.status),
                PortChange::from_bits_retain(p.change),
            )
        })
    }

    pub fn set_lpm_timeouts(&self, u1: u16, u2: u16) {
        self.state().lpm_timeouts = (u1, u2);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state().log.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state().log.len()
    }

    pub fn requests_since(&self, mark: usize) -> Vec<Request> {
        self.state().log[mark..].to_vec()
    }

    pub fn status_reads(&self) -> usize {
        self.state().status_reads
    }

    pub fn cancelled_reads(&self) -> usize {
        self.state().cancelled_reads
    }

    pub fn freed(&self) -> Vec<String> {
        self.state().freed.clone()
    }

    pub fn tt_completions(&self) -> Vec<u8> {
        self.state().tt_completions.clone()
    }
}

impl HostController for SimBus {
    fn capabilities(&self) -> HostCapabilities {
        self.caps
    }

    fn control(
        &self,
        device: &Device,
        setup: SetupPacket,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransferError> {
        let now = self.clock.now();
        let mut guard = self.state();
        let state = &mut *guard;
        state.log.push(Request {
            device: device.name().to_string(),
            route: device.route().to_vec(),
            setup,
            data: if setup.is_device_to_host() {
                Vec::new()
            } else {
                data.to_vec()
            },
        });
        let node = reachable(&mut state.root, device.route())?;
        node.handle(setup, data, now)
    }

    fn submit_status_read(&self, hub_device: &Device) -> Result<(), TransferError> {
        let mut guard = self.state();
        let state = &mut *guard;
        reachable(&mut state.root, hub_device.route())?;
        state.status_reads += 1;
        Ok(())
    }

    fn cancel_status_read(&self, _hub_device: &Device) {
        self.state().cancelled_reads += 1;
    }

    fn free_device(&self, device: &Device) {
        self.state().freed.push(device.name().to_string());
    }

    fn enable_lpm_timeout(&self, _device: &Device, state: LpmState) -> Result<u16, TransferError> {
        let (u1, u2) = self.state().lpm_timeouts;
        Ok(match state {
            LpmState::U1 => u1,
            LpmState::U2 => u2,
        })
    }

    fn clear_tt_buffer_complete(&self, request: &TtClearRequest) {
        self.state().tt_completions.push(request.endpoint);
    }
}

/// An engine with one simulated bus, driven synchronously in virtual time.
pub struct Harness {
    pub clock: Arc<FakeClock>,
    pub sim: Arc<SimBus>,
    pub registry: Arc<RecordingRegistry>,
    pub engine: Arc<HubEngine>,
    pub bus: Arc<Bus>,
}

impl Harness {
    pub fn new(caps: HostCapabilities, root_ports: u8) -> Self {
        Self::with_config(caps, root_ports, HubConfig::default())
    }

    pub fn high_speed(root_ports: u8) -> Self {
        Self::new(HostCapabilities::default(), root_ports)
    }

    pub fn with_config(caps: HostCapabilities, root_ports: u8, config: HubConfig) -> Self {
        init_tracing();
        let clock = FakeClock::new();
        let sim = SimBus::new(caps, clock.clone(), DeviceSpec::root_hub(caps.root_speed, root_ports));
        let registry = Arc::new(RecordingRegistry::default());
        let engine = HubEngine::new(config, clock.clone(), registry.clone());
        let bus = engine.add_bus(sim.clone()).expect("root hub registers");
        let harness = Self {
            clock,
            sim,
            registry,
            engine,
            bus,
        };
        harness.settle();
        harness
    }

    /// Runs the dispatcher until nothing is queued or armed.
    pub fn settle(&self) {
        self.engine.run_until_idle(Duration::from_secs(60));
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn root(&self) -> Arc<Device> {
        self.bus.root_hub().expect("bus has a root hub")
    }

    pub fn device(&self, route: &[u8]) -> Option<Arc<Device>> {
        let mut device = self.root();
        for &port in route {
            device = self.engine.find_child(&device, port)?;
        }
        Some(device)
    }

    pub fn hub_at(&self, route: &[u8]) -> Arc<Hub> {
        self.device(route)
            .and_then(|d| d.hub())
            .expect("hub driver bound at route")
    }

    /// Completes the hub's status read with a change on `port`.
    pub fn port_event(&self, route: &[u8], port: u8) {
        let hub = self.hub_at(route);
        let bitmap = (1u32 << port).to_le_bytes();
        self.engine.hub_irq(&hub, Ok(&bitmap[..]));
    }

    pub fn attach(&self, route: &[u8], port: u8, spec: DeviceSpec) -> Arc<Device> {
        self.sim.plug(route, port, spec);
        self.port_event(route, port);
        self.settle();
        let mut full = route.to_vec();
        full.push(port);
        self.device(&full).expect("device enumerated")
    }

    pub fn detach(&self, route: &[u8], port: u8) {
        self.sim.unplug(route, port);
        self.port_event(route, port);
        self.settle();
    }
}
