//! Parsers for the descriptors the engine reads while enumerating and configuring hubs.
//!
//! Parsed descriptors keep their raw bytes. Reset-and-verify compares the raw bytes to tell
//! whether a device changed identity across a reset.

use crate::request::{DT_BOS, DT_CONFIG, DT_DEVICE, DT_DEVICE_CAPABILITY, DT_ENDPOINT, DT_HUB};
use crate::request::{DT_INTERFACE, DT_SS_HUB};

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIG_HEADER_LEN: usize = 9;
pub const BOS_HEADER_LEN: usize = 5;
pub const DEVICE_QUALIFIER_LEN: usize = 10;

pub const CLASS_HUB: u8 = 0x09;

pub const CONFIG_ATTR_WAKEUP: u8 = 0x20;
pub const CONFIG_ATTR_SELF_POWERED: u8 = 0x40;

pub const HUB_CHAR_LPSM: u16 = 0x0003;
pub const HUB_CHAR_COMPOUND: u16 = 0x0004;
pub const HUB_CHAR_OCPM: u16 = 0x0018;
pub const HUB_CHAR_TTTT: u16 = 0x0060;
pub const HUB_CHAR_PORTIND: u16 = 0x0080;

const CAP_USB2_EXTENSION: u8 = 0x02;
const CAP_SS_USB: u8 = 0x03;
const USB2_EXT_LPM: u32 = 1 << 1;
const SS_CAP_LTM: u8 = 1 << 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub raw: Vec<u8>,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < DEVICE_DESCRIPTOR_LEN || buf[1] != DT_DEVICE {
            return None;
        }
        let buf = &buf[..DEVICE_DESCRIPTOR_LEN];
        Some(Self {
            raw: buf.to_vec(),
            bcd_usb: le16(buf, 2),
            device_class: buf[4],
            device_subclass: buf[5],
            device_protocol: buf[6],
            max_packet_size0: buf[7],
            vendor_id: le16(buf, 8),
            product_id: le16(buf, 10),
            bcd_device: le16(buf, 12),
            i_manufacturer: buf[14],
            i_product: buf[15],
            i_serial: buf[16],
            num_configurations: buf[17],
        })
    }
}

/// The first 8 bytes of a device descriptor, which is all a device at address 0 must return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePrefix {
    pub descriptor_type: u8,
    pub bcd_usb: u16,
    pub max_packet_size0: u8,
}

impl DevicePrefix {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 8 {
            return None;
        }
        Some(Self {
            descriptor_type: buf[1],
            bcd_usb: le16(buf, 2),
            max_packet_size0: buf[7],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    /// 0 control, 1 isochronous, 2 bulk, 3 interrupt.
    pub fn transfer_type(&self) -> u8 {
        self.attributes & 0x03
    }

    pub fn is_interrupt_in(&self) -> bool {
        self.is_in() && self.transfer_type() == 3
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub raw: Vec<u8>,
    pub value: u8,
    pub num_interfaces: u8,
    pub attributes: u8,
    /// `bMaxPower` in descriptor units (2 mA, or 8 mA for SuperSpeed).
    pub max_power: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigDescriptor {
    /// `wTotalLength` from a configuration header.
    pub fn total_length(header: &[u8]) -> Option<u16> {
        if header.len() < 4 || header[1] != DT_CONFIG {
            return None;
        }
        Some(le16(header, 2))
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < CONFIG_HEADER_LEN || buf[1] != DT_CONFIG {
            return None;
        }
        let total = (le16(buf, 2) as usize).min(buf.len());

        let mut interfaces: Vec<InterfaceDescriptor> = Vec::new();
        let mut off = buf[0] as usize;
        while off + 2 <= total {
            let len = buf[off] as usize;
            if len < 2 || off + len > total {
                break;
            }
            let desc = &buf[off..off + len];
            match desc[1] {
                DT_INTERFACE if len >= 9 => interfaces.push(InterfaceDescriptor {
                    number: desc[2],
                    alternate: desc[3],
                    class: desc[5],
                    subclass: desc[6],
                    protocol: desc[7],
                    endpoints: Vec::new(),
                }),
                DT_ENDPOINT if len >= 7 => {
                    if let Some(intf) = interfaces.last_mut() {
                        intf.endpoints.push(EndpointDescriptor {
                            address: desc[2],
                            attributes: desc[3],
                            max_packet_size: le16(desc, 4),
                            interval: desc[6],
                        });
                    }
                }
                _ => {}
            }
            off += len;
        }

        Some(Self {
            raw: buf[..total].to_vec(),
            value: buf[5],
            num_interfaces: buf[4],
            attributes: buf[7],
            max_power: buf[8],
            interfaces,
        })
    }

    pub fn interface(&self, number: u8, alternate: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|i| i.number == number && i.alternate == alternate)
    }

    pub fn is_hub(&self) -> bool {
        self.interfaces.iter().any(|i| i.class == CLASS_HUB)
    }

    pub fn remote_wakeup(&self) -> bool {
        self.attributes & CONFIG_ATTR_WAKEUP != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSwitching {
    Ganged,
    Individual,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverCurrentProtection {
    Global,
    Individual,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubDescriptor {
    pub superspeed: bool,
    pub num_ports: u8,
    pub characteristics: u16,
    /// Power-on to power-good time in 2 ms units.
    pub pwr_on_2_pwr_good: u8,
    /// Hub controller current in mA.
    pub hub_contr_current: u8,
    /// SuperSpeed header decode latency in 0.1 µs units.
    pub hdr_dec_lat: u8,
    pub hub_delay: u16,
    /// Bit `n` set means the device on port `n` is not removable.
    pub device_removable: u32,
}

impl HubDescriptor {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 7 {
            return None;
        }
        let superspeed = match buf[1] {
            DT_HUB => false,
            DT_SS_HUB => true,
            _ => return None,
        };
        let num_ports = buf[2];

        let mut desc = Self {
            superspeed,
            num_ports,
            characteristics: le16(buf, 3),
            pwr_on_2_pwr_good: buf[5],
            hub_contr_current: buf[6],
            hdr_dec_lat: 0,
            hub_delay: 0,
            device_removable: 0,
        };

        if superspeed {
            if buf.len() < 12 {
                return None;
            }
            desc.hdr_dec_lat = buf[7];
            desc.hub_delay = le16(buf, 8);
            desc.device_removable = le16(buf, 10) as u32;
        } else {
            let bytes = (num_ports as usize + 1 + 7) / 8;
            for (i, byte) in buf.iter().skip(7).take(bytes.min(4)).enumerate() {
                desc.device_removable |= (*byte as u32) << (8 * i);
            }
        }
        Some(desc)
    }

    pub fn is_compound(&self) -> bool {
        self.characteristics & HUB_CHAR_COMPOUND != 0
    }

    pub fn power_switching(&self) -> PowerSwitching {
        match self.characteristics & HUB_CHAR_LPSM {
            0 => PowerSwitching::Ganged,
            1 => PowerSwitching::Individual,
            _ => PowerSwitching::None,
        }
    }

    pub fn over_current_protection(&self) -> OverCurrentProtection {
        match self.characteristics & HUB_CHAR_OCPM {
            0x0000 => OverCurrentProtection::Global,
            0x0008 => OverCurrentProtection::Individual,
            _ => OverCurrentProtection::None,
        }
    }

    /// TT think time in full-speed bit times, scaled to nanoseconds.
    pub fn think_time_ns(&self, device_protocol: u8) -> u32 {
        match (self.characteristics & HUB_CHAR_TTTT) >> 5 {
            0 if device_protocol != 0 => 666,
            0 => 0,
            1 => 666 * 2,
            2 => 666 * 3,
            _ => 666 * 4,
        }
    }

    pub fn has_port_indicators(&self) -> bool {
        self.characteristics & HUB_CHAR_PORTIND != 0
    }

    pub fn port_is_removable(&self, port: u8) -> bool {
        self.device_removable & (1 << port) == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsCapability {
    pub attributes: u8,
    /// U1 device exit latency in µs.
    pub u1_dev_exit_lat: u8,
    /// U2 device exit latency in µs.
    pub u2_dev_exit_lat: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bos {
    pub raw: Vec<u8>,
    pub usb2_ext_attributes: Option<u32>,
    pub ss_cap: Option<SsCapability>,
}

impl Bos {
    pub fn total_length(header: &[u8]) -> Option<u16> {
        if header.len() < BOS_HEADER_LEN || header[1] != DT_BOS {
            return None;
        }
        Some(le16(header, 2))
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let total = (Self::total_length(buf)? as usize).min(buf.len());
        let mut bos = Bos {
            raw: buf[..total].to_vec(),
            ..Bos::default()
        };

        let mut off = buf[0] as usize;
        while off + 3 <= total {
            let len = buf[off] as usize;
            if len < 3 || off + len > total {
                break;
            }
            let cap = &buf[off..off + len];
            if cap[1] == DT_DEVICE_CAPABILITY {
                match cap[2] {
                    CAP_USB2_EXTENSION if len >= 7 => {
                        bos.usb2_ext_attributes =
                            Some(u32::from_le_bytes([cap[3], cap[4], cap[5], cap[6]]));
                    }
                    CAP_SS_USB if len >= 10 => {
                        bos.ss_cap = Some(SsCapability {
                            attributes: cap[3],
                            u1_dev_exit_lat: cap[7],
                            u2_dev_exit_lat: le16(cap, 8),
                        });
                    }
                    _ => {}
                }
            }
            off += len;
        }
        Some(bos)
    }

    pub fn usb2_lpm_supported(&self) -> bool {
        self.usb2_ext_attributes
            .is_some_and(|attrs| attrs & USB2_EXT_LPM != 0)
    }

    pub fn ltm_supported(&self) -> bool {
        self.ss_cap
            .is_some_and(|cap| cap.attributes & SS_CAP_LTM != 0)
    }
}

/// Decodes a UTF-16LE string descriptor.
pub fn parse_string(buf: &[u8]) -> Option<String> {
    if buf.len() < 2 || buf[1] != crate::request::DT_STRING {
        return None;
    }
    let len = (buf[0] as usize).min(buf.len());
    let units: Vec<u16> = buf[2..len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}
