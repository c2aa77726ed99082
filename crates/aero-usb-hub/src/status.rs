//! Hub and port status words (USB 2.0 §11.24.2.6-7, USB 3.0 §10.16.2.6).

use bitflags::bitflags;

bitflags! {
    /// `wPortStatus`. SuperSpeed hubs reuse bits 5..8 for the link state and move power to bit 9.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const L1 = 1 << 5;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const TEST = 1 << 11;
        const INDICATOR = 1 << 12;

        const SS_LINK_STATE = 0x01e0;
        const SS_POWER = 1 << 9;
        const SS_SPEED = 0x1c00;
    }
}

bitflags! {
    /// `wPortChange`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortChange: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const L1 = 1 << 5;
        const BH_RESET = 1 << 5;
        const LINK_STATE = 1 << 6;
        const CONFIG_ERROR = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HubStatus: u16 {
        const LOCAL_POWER = 1 << 0;
        const OVER_CURRENT = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HubChange: u16 {
        const LOCAL_POWER = 1 << 0;
        const OVER_CURRENT = 1 << 1;
    }
}

impl PortStatus {
    pub fn link_state(self) -> LinkState {
        LinkState::from_status(self)
    }

    pub fn is_powered(self, superspeed: bool) -> bool {
        if superspeed {
            self.contains(PortStatus::SS_POWER)
        } else {
            self.contains(PortStatus::POWER)
        }
    }

    /// A SuperSpeed link stuck in SS.Inactive or Compliance only recovers through a warm reset.
    pub fn warm_reset_required(self, superspeed: bool) -> bool {
        superspeed && matches!(self.link_state(), LinkState::SsInactive | LinkState::Compliance)
    }
}

/// SuperSpeed link states as encoded in bits 5..8 of `wPortStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    U0 = 0,
    U1 = 1,
    U2 = 2,
    U3 = 3,
    SsDisabled = 4,
    RxDetect = 5,
    SsInactive = 6,
    Polling = 7,
    Recovery = 8,
    HotReset = 9,
    Compliance = 10,
    Loopback = 11,
}

impl LinkState {
    pub fn from_status(status: PortStatus) -> Self {
        match (status.bits() & PortStatus::SS_LINK_STATE.bits()) >> 5 {
            0 => LinkState::U0,
            1 => LinkState::U1,
            2 => LinkState::U2,
            3 => LinkState::U3,
            4 => LinkState::SsDisabled,
            5 => LinkState::RxDetect,
            6 => LinkState::SsInactive,
            7 => LinkState::Polling,
            8 => LinkState::Recovery,
            9 => LinkState::HotReset,
            10 => LinkState::Compliance,
            // 12..15 are reserved; treat them like a link in training.
            _ => LinkState::Loopback,
        }
    }

    /// Value placed in the high byte of `wIndex` for `SET_FEATURE(PORT_LINK_STATE)`.
    pub fn selector(self) -> u16 {
        self as u16
    }

    pub fn status_bits(self) -> u16 {
        (self as u16) << 5
    }
}

/// Port feature selectors (USB 2.0 Table 11-17, USB 3.0 Table 10-9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    LinkState = 5,
    Power = 8,
    LowSpeed = 9,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
    Test = 21,
    Indicator = 22,
    U1Timeout = 23,
    U2Timeout = 24,
    CLinkState = 25,
    CConfigError = 26,
    RemoteWakeMask = 27,
    BhReset = 28,
    CBhReset = 29,
    ForceLinkPmAccept = 30,
}

impl PortFeature {
    pub fn selector(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HubFeature {
    CLocalPower = 0,
    COverCurrent = 1,
}

impl HubFeature {
    pub fn selector(self) -> u16 {
        self as u16
    }
}

/// Remote-wake mask bits for `SET_FEATURE(PORT_REMOTE_WAKE_MASK)`, in the high byte of `wIndex`.
pub const REMOTE_WAKE_MASK_CONNECT: u16 = 1 << 8;
pub const REMOTE_WAKE_MASK_DISCONNECT: u16 = 1 << 9;
pub const REMOTE_WAKE_MASK_OVER_CURRENT: u16 = 1 << 10;

/// Port indicator selectors for `SET_FEATURE(PORT_INDICATOR)`.
pub const INDICATOR_AUTO: u8 = 0;
pub const INDICATOR_AMBER: u8 = 1;
pub const INDICATOR_GREEN: u8 = 2;
pub const INDICATOR_OFF: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Speed {
    Unknown,
    Low,
    Full,
    High,
    Super,
}

impl Speed {
    pub fn is_superspeed(self) -> bool {
        self == Speed::Super
    }
}

/// Splits a 4-byte GET_STATUS response into its status and change words.
pub fn decode_status_words(buf: &[u8]) -> Option<(u16, u16)> {
    if buf.len() < 4 {
        return None;
    }
    Some((
        u16::from_le_bytes([buf[0], buf[1]]),
        u16::from_le_bytes([buf[2], buf[3]]),
    ))
}
