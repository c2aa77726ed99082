//! Control request construction.
//!
//! Every hub and device operation the engine performs is expressed as a [`SetupPacket`] handed
//! to the [`crate::transport::HostController`].

use crate::status::{HubFeature, LinkState, PortFeature};

pub const DIR_IN: u8 = 0x80;
pub const RT_DEVICE: u8 = 0x00;
pub const RT_INTERFACE: u8 = 0x01;
pub const RT_HUB: u8 = 0x20;
pub const RT_PORT: u8 = 0x23;

pub const REQ_GET_STATUS: u8 = 0x00;
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
pub const REQ_SET_FEATURE: u8 = 0x03;
pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_CLEAR_TT_BUFFER: u8 = 0x08;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
pub const REQ_SET_INTERFACE: u8 = 0x0b;
pub const REQ_SET_HUB_DEPTH: u8 = 0x0c;
pub const REQ_SET_SEL: u8 = 0x30;

pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_STRING: u8 = 0x03;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_DEVICE_QUALIFIER: u8 = 0x06;
pub const DT_BOS: u8 = 0x0f;
pub const DT_DEVICE_CAPABILITY: u8 = 0x10;
pub const DT_HUB: u8 = 0x29;
pub const DT_SS_HUB: u8 = 0x2a;

pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
pub const DEVICE_U1_ENABLE: u16 = 48;
pub const DEVICE_U2_ENABLE: u16 = 49;
pub const DEVICE_LTM_ENABLE: u16 = 50;

pub const INTERFACE_FUNCTION_SUSPEND: u16 = 0;
/// Function-suspend options, carried in the high byte of `wIndex`.
pub const FUNC_SUSPEND_LP: u16 = 1 << 0;
pub const FUNC_SUSPEND_RW: u16 = 1 << 1;

/// Device GET_STATUS bits.
pub const DEVICE_STATUS_SELF_POWERED: u16 = 1 << 0;
pub const DEVICE_STATUS_REMOTE_WAKEUP: u16 = 1 << 1;
/// Interface GET_STATUS bits (USB 3.0 §9.4.5).
pub const INTERFACE_STATUS_RW_CAPABLE: u16 = 1 << 0;
pub const INTERFACE_STATUS_RW_ENABLED: u16 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(self) -> bool {
        (self.bm_request_type & DIR_IN) != 0
    }

    fn new(bm_request_type: u8, b_request: u8, w_value: u16, w_index: u16, w_length: u16) -> Self {
        Self {
            bm_request_type,
            b_request,
            w_value,
            w_index,
            w_length,
        }
    }

    pub fn get_hub_status() -> Self {
        Self::new(DIR_IN | RT_HUB, REQ_GET_STATUS, 0, 0, 4)
    }

    pub fn get_port_status(port: u8) -> Self {
        Self::new(DIR_IN | RT_PORT, REQ_GET_STATUS, 0, port as u16, 4)
    }

    pub fn set_port_feature(port: u8, feature: PortFeature) -> Self {
        Self::new(RT_PORT, REQ_SET_FEATURE, feature.selector(), port as u16, 0)
    }

    /// `SET_FEATURE` on a port with a selector byte in the high half of `wIndex`.
    pub fn set_port_feature_with(port: u8, feature: PortFeature, high: u16) -> Self {
        Self::new(
            RT_PORT,
            REQ_SET_FEATURE,
            feature.selector(),
            (high << 8) | port as u16,
            0,
        )
    }

    pub fn clear_port_feature(port: u8, feature: PortFeature) -> Self {
        Self::new(RT_PORT, REQ_CLEAR_FEATURE, feature.selector(), port as u16, 0)
    }

    pub fn clear_hub_feature(feature: HubFeature) -> Self {
        Self::new(RT_HUB, REQ_CLEAR_FEATURE, feature.selector(), 0, 0)
    }

    pub fn set_link_state(port: u8, state: LinkState) -> Self {
        Self::set_port_feature_with(port, PortFeature::LinkState, state.selector())
    }

    pub fn set_port_indicator(port: u8, selector: u8) -> Self {
        Self::set_port_feature_with(port, PortFeature::Indicator, selector as u16)
    }

    pub fn set_remote_wake_mask(port: u8, mask: u16) -> Self {
        Self::new(
            RT_PORT,
            REQ_SET_FEATURE,
            PortFeature::RemoteWakeMask.selector(),
            port as u16 | mask,
            0,
        )
    }

    pub fn get_hub_descriptor(superspeed: bool, length: u16) -> Self {
        let ty = if superspeed { DT_SS_HUB } else { DT_HUB };
        Self::new(
            DIR_IN | RT_HUB,
            REQ_GET_DESCRIPTOR,
            (ty as u16) << 8,
            0,
            length,
        )
    }

    pub fn set_hub_depth(depth: u16) -> Self {
        Self::new(RT_HUB, REQ_SET_HUB_DEPTH, depth, 0, 0)
    }

    pub fn clear_tt_buffer(devinfo: u16, tt: u16) -> Self {
        Self::new(RT_PORT, REQ_CLEAR_TT_BUFFER, devinfo, tt, 0)
    }

    pub fn get_descriptor(ty: u8, index: u8, lang: u16, length: u16) -> Self {
        Self::new(
            DIR_IN | RT_DEVICE,
            REQ_GET_DESCRIPTOR,
            ((ty as u16) << 8) | index as u16,
            lang,
            length,
        )
    }

    pub fn get_device_status() -> Self {
        Self::new(DIR_IN | RT_DEVICE, REQ_GET_STATUS, 0, 0, 2)
    }

    pub fn get_interface_status(interface: u8) -> Self {
        Self::new(DIR_IN | RT_INTERFACE, REQ_GET_STATUS, 0, interface as u16, 2)
    }

    pub fn set_address(devnum: u8) -> Self {
        Self::new(RT_DEVICE, REQ_SET_ADDRESS, devnum as u16, 0, 0)
    }

    pub fn set_configuration(value: u8) -> Self {
        Self::new(RT_DEVICE, REQ_SET_CONFIGURATION, value as u16, 0, 0)
    }

    pub fn set_interface(interface: u8, alt: u8) -> Self {
        Self::new(
            RT_INTERFACE,
            REQ_SET_INTERFACE,
            alt as u16,
            interface as u16,
            0,
        )
    }

    pub fn set_device_feature(feature: u16) -> Self {
        Self::new(RT_DEVICE, REQ_SET_FEATURE, feature, 0, 0)
    }

    pub fn clear_device_feature(feature: u16) -> Self {
        Self::new(RT_DEVICE, REQ_CLEAR_FEATURE, feature, 0, 0)
    }

    /// Interface `FUNCTION_SUSPEND` with `options` (RW/LP) in the high byte of `wIndex`.
    pub fn function_suspend(interface: u8, options: u16) -> Self {
        Self::new(
            RT_INTERFACE,
            REQ_SET_FEATURE,
            INTERFACE_FUNCTION_SUSPEND,
            (options << 8) | interface as u16,
            0,
        )
    }

    pub fn clear_function_suspend(interface: u8) -> Self {
        Self::new(
            RT_INTERFACE,
            REQ_CLEAR_FEATURE,
            INTERFACE_FUNCTION_SUSPEND,
            interface as u16,
            0,
        )
    }

    pub fn set_sel() -> Self {
        Self::new(RT_DEVICE, REQ_SET_SEL, 0, 0, 6)
    }
}
