//! USB 3 link power management (U1/U2) and Latency Tolerance Messaging.
//!
//! Exit latency bookkeeping follows USB 3.0 §C.1.5: every device carries a max exit latency (MEL),
//! a path exit latency (PEL) and a system exit latency (SEL) per link state, in nanoseconds.

use tracing::{debug, warn};

use crate::device::{Device, DeviceState, LpmParams};
use crate::engine::HubEngine;
use crate::error::{HubError, Result};
use crate::request::{SetupPacket, DEVICE_LTM_ENABLE, DEVICE_U1_ENABLE, DEVICE_U2_ENABLE};
use crate::status::{PortFeature, Speed};

/// SET_SEL limits, in µs.
pub const MAX_U1_SEL_PEL: u32 = 127;
pub const MAX_U2_SEL_PEL: u32 = 65535;

/// Largest U1 timeout a hub accepts, besides [`DEVICE_INITIATED_TIMEOUT`].
pub const MAX_U1_TIMEOUT: u16 = 0x7f;
/// Timeout value that leaves link state entry to the device.
pub const DEVICE_INITIATED_TIMEOUT: u16 = 0xff;

/// Time the first hub needs to forward a ping (tHubPort2PortExitLat aside).
const FIRST_HUB_DELAY_NS: u32 = 2100;
/// Additional ping forwarding time per further hub.
const HUB_DELAY_NS: u32 = 250;
/// tHubDriveRemote per hub.
const HUB_DRIVE_REMOTE_NS: u32 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpmState {
    U1,
    U2,
}

/// Max exit latency of a device: what its parent hub already needs, the hub header decode
/// latency, and the slower of the two link partners.
pub fn mel(hub_mel: u32, hub_hdr_dec_lat: u8, dev_exit_us: u32, hub_exit_us: u32) -> u32 {
    hub_mel + u32::from(hub_hdr_dec_lat) * 100 + dev_exit_us.max(hub_exit_us) * 1000
}

/// Path exit latency: the first link's exit or the hub's own path plus its port-to-port delay,
/// whichever is longer.
pub fn pel(dev_exit_us: u32, hub_exit_us: u32, hub_pel: u32, port_to_port_us: u32) -> u32 {
    let first_link = dev_exit_us.max(hub_exit_us) * 1000;
    first_link.max(port_to_port_us * 1000 + hub_pel)
}

/// System exit latency for a device `hops` external hubs below the root port.
pub fn sel(pel: u32, hops: u32) -> u32 {
    let mut total = pel;
    if hops > 0 {
        total += FIRST_HUB_DELAY_NS + HUB_DELAY_NS * (hops - 1);
    }
    total + HUB_DRIVE_REMOTE_NS * hops
}

/// Port-to-port exit latency of a hub in µs.
pub fn port_to_port_delay(state: LpmState, hub_u1_exit_us: u32, hub_u2_exit_us: u32) -> u32 {
    match state {
        LpmState::U1 => 1,
        LpmState::U2 if hub_u2_exit_us > hub_u1_exit_us => 1 + hub_u2_exit_us - hub_u1_exit_us,
        LpmState::U2 => 1 + hub_u1_exit_us,
    }
}

/// Builds the 6-byte SET_SEL payload for enabling `state`.
///
/// Values are rounded up to µs. The state being enabled must fit the protocol limits; the other
/// state is clamped.
pub fn set_sel_payload(u1: &LpmParams, u2: &LpmParams, state: LpmState) -> Result<[u8; 6]> {
    let u1_sel = u1.sel.div_ceil(1000);
    let u1_pel = u1.pel.div_ceil(1000);
    let u2_sel = u2.sel.div_ceil(1000);
    let u2_pel = u2.pel.div_ceil(1000);

    let too_large = match state {
        LpmState::U1 => u1_sel > MAX_U1_SEL_PEL || u1_pel > MAX_U1_SEL_PEL,
        LpmState::U2 => u2_sel > MAX_U2_SEL_PEL || u2_pel > MAX_U2_SEL_PEL,
    };
    if too_large {
        return Err(HubError::Invalid("exit latency too large for SET_SEL"));
    }

    let u2_sel = u2_sel.min(MAX_U2_SEL_PEL) as u16;
    let u2_pel = u2_pel.min(MAX_U2_SEL_PEL) as u16;
    let mut payload = [0u8; 6];
    payload[0] = u1_sel.min(MAX_U1_SEL_PEL) as u8;
    payload[1] = u1_pel.min(MAX_U1_SEL_PEL) as u8;
    payload[2..4].copy_from_slice(&u2_sel.to_le_bytes());
    payload[4..6].copy_from_slice(&u2_pel.to_le_bytes());
    Ok(payload)
}

fn params(udev: &Device, state: LpmState) -> LpmParams {
    match state {
        LpmState::U1 => udev.u1_params(),
        LpmState::U2 => udev.u2_params(),
    }
}

/// U1/U2 exit latencies in µs from the SuperSpeed device capability.
fn exit_latencies(udev: &Device) -> Option<(u32, u32)> {
    let inner = udev.inner();
    let cap = inner.bos.as_ref()?.ss_cap?;
    Some((u32::from(cap.u1_dev_exit_lat), u32::from(cap.u2_dev_exit_lat)))
}

impl HubEngine {
    pub(crate) fn device_supports_lpm(&self, udev: &Device) -> bool {
        let inner = udev.inner();
        let Some(bos) = inner.bos.as_ref() else {
            return false;
        };
        if inner.speed == Speed::High {
            if bos.usb2_lpm_supported() {
                debug!(device = %udev.name(), "USB 2 link power management supported");
                return true;
            }
            return false;
        }
        if bos.ss_cap.is_none() {
            return false;
        }
        drop(inner);

        match udev.parent() {
            None => true,
            // A root hub without BOS still does LPM if its controller programs timeouts.
            Some(parent) if parent.is_root_hub() && parent.inner().bos.is_none() => {
                parent.capabilities().lpm_timeouts
            }
            Some(parent) => parent.lpm_capable(),
        }
    }

    /// Derives `udev`'s U1/U2 MEL, PEL and SEL from its own and its parent hub's exit latencies.
    pub(crate) fn set_lpm_parameters(&self, udev: &Device) {
        if !udev.lpm_capable() || udev.speed() != Speed::Super {
            return;
        }
        let Some(parent) = udev.parent() else {
            return;
        };
        let Some(hub) = parent.hub() else {
            return;
        };
        let Some((dev_u1, dev_u2)) = exit_latencies(udev) else {
            return;
        };
        let (hub_u1, hub_u2) = exit_latencies(&parent).unwrap_or_else(|| {
            let caps = parent.capabilities();
            if parent.is_root_hub() {
                (u32::from(caps.root_u1_exit_lat), u32::from(caps.root_u2_exit_lat))
            } else {
                (0, 0)
            }
        });
        let (parent_u1, parent_u2) = (parent.u1_params(), parent.u2_params());
        let hdr_dec_lat = hub.descriptor.hdr_dec_lat;
        let hops = u32::from(udev.level().saturating_sub(1));

        let mut inner = udev.inner();
        inner.u1.mel = mel(parent_u1.mel, hdr_dec_lat, dev_u1, hub_u1);
        inner.u2.mel = mel(parent_u2.mel, hdr_dec_lat, dev_u2, hub_u2);
        inner.u1.pel = pel(
            dev_u1,
            hub_u1,
            parent_u1.pel,
            port_to_port_delay(LpmState::U1, hub_u1, hub_u2),
        );
        inner.u2.pel = pel(
            dev_u2,
            hub_u2,
            parent_u2.pel,
            port_to_port_delay(LpmState::U2, hub_u1, hub_u2),
        );
        inner.u1.sel = sel(inner.u1.pel, hops);
        inner.u2.sel = sel(inner.u2.pel, hops);
        debug!(
            device = %udev.name(),
            u1_mel = inner.u1.mel,
            u1_sel = inner.u1.sel,
            u2_mel = inner.u2.mel,
            u2_sel = inner.u2.sel,
            "LPM parameters"
        );
    }

    fn set_sel(&self, udev: &Device, state: LpmState) -> Result<()> {
        let mut payload = set_sel_payload(&udev.u1_params(), &udev.u2_params(), state)
            .inspect_err(|_| {
                debug!(device = %udev.name(), ?state, "exit latency too large, not enabling");
            })?;
        udev.control(SetupPacket::set_sel(), &mut payload, self.config.control_timeout)
            .map(|_| ())
    }

    fn set_device_initiated_lpm(&self, udev: &Device, state: LpmState, enable: bool) -> Result<()> {
        if udev.state() != DeviceState::Configured {
            return Err(HubError::Invalid("device not configured"));
        }
        let feature = match state {
            LpmState::U1 => DEVICE_U1_ENABLE,
            LpmState::U2 => DEVICE_U2_ENABLE,
        };
        let setup = if enable {
            SetupPacket::set_device_feature(feature)
        } else {
            SetupPacket::clear_device_feature(feature)
        };
        udev.control_out(setup, self.config.control_timeout)
            .map_err(|err| {
                warn!(device = %udev.name(), ?state, enable, error = %err, "device-initiated LPM request failed");
                HubError::Busy
            })
    }

    fn set_lpm_timeout(&self, udev: &Device, state: LpmState, timeout: u16) -> Result<()> {
        let (feature, limit) = match state {
            LpmState::U1 => (PortFeature::U1Timeout, MAX_U1_TIMEOUT),
            LpmState::U2 => (PortFeature::U2Timeout, DEVICE_INITIATED_TIMEOUT - 1),
        };
        if timeout > limit && timeout != DEVICE_INITIATED_TIMEOUT {
            warn!(device = %udev.name(), ?state, timeout, "invalid LPM timeout");
            return Err(HubError::Invalid("LPM timeout out of range"));
        }
        let hub = udev.parent().and_then(|p| p.hub()).ok_or(HubError::NoDevice)?;
        self.set_port_feature_with(&hub, udev.portnum(), feature, timeout)
            .map_err(|err| {
                warn!(device = %udev.name(), ?state, timeout, error = %err, "failed to set LPM timeout");
                HubError::Busy
            })?;

        let mut inner = udev.inner();
        match state {
            LpmState::U1 => inner.u1.timeout = timeout,
            LpmState::U2 => inner.u2.timeout = timeout,
        }
        Ok(())
    }

    fn enable_link_state(&self, udev: &Device, state: LpmState) {
        let exit = exit_latencies(udev).map_or(0, |(u1, u2)| match state {
            LpmState::U1 => u1,
            LpmState::U2 => u2,
        });
        // No exit latency usually means the device does not implement the state.
        if exit == 0 {
            return;
        }

        if self.set_sel(udev, state).is_err() {
            warn!(device = %udev.name(), ?state, "set SEL failed, not enabling");
            return;
        }

        let timeout = match udev.controller.enable_lpm_timeout(udev, state) {
            Ok(0) => return,
            Ok(timeout) => timeout,
            Err(err) => {
                warn!(device = %udev.name(), ?state, error = %err, "could not enable LPM timeout");
                return;
            }
        };

        if self.set_lpm_timeout(udev, state, timeout).is_err() {
            let _ = udev.controller.disable_lpm_timeout(udev, state);
        } else if udev.active_config().is_some() {
            let _ = self.set_device_initiated_lpm(udev, state, true);
        }
    }

    fn disable_link_state(&self, udev: &Device, state: LpmState) -> Result<()> {
        if self.set_lpm_timeout(udev, state, 0).is_err() {
            return Err(HubError::Busy);
        }
        let _ = self.set_device_initiated_lpm(udev, state, false);
        if let Err(err) = udev.controller.disable_lpm_timeout(udev, state) {
            warn!(device = %udev.name(), ?state, error = %err, "could not disable LPM timeout");
        }
        Ok(())
    }

    fn lpm_applies(&self, udev: &Device) -> bool {
        udev.parent().is_some()
            && udev.speed() == Speed::Super
            && udev.lpm_capable()
            && udev.state() >= DeviceState::Configured
            && udev.capabilities().lpm_timeouts
    }

    /// Disables U1 and U2 on `udev`'s link. Calls nest; every successful call must be paired
    /// with [`enable_lpm`](Self::enable_lpm).
    pub fn disable_lpm(&self, udev: &Device) -> Result<()> {
        if !self.lpm_applies(udev) {
            return Ok(());
        }
        udev.inner().lpm_disable_count += 1;

        let params = (params(udev, LpmState::U1), params(udev, LpmState::U2));
        if params.0.timeout == 0 && params.1.timeout == 0 {
            return Ok(());
        }
        let disabled = self
            .disable_link_state(udev, LpmState::U1)
            .and_then(|()| self.disable_link_state(udev, LpmState::U2));
        if disabled.is_err() {
            self.enable_lpm(udev);
            return Err(HubError::Busy);
        }
        Ok(())
    }

    /// Drops one disable reference and, once none remain, enables U1 and U2.
    pub fn enable_lpm(&self, udev: &Device) {
        if !self.lpm_applies(udev) {
            return;
        }
        let remaining = {
            let mut inner = udev.inner();
            inner.lpm_disable_count = inner.lpm_disable_count.saturating_sub(1);
            inner.lpm_disable_count
        };
        if remaining > 0 {
            return;
        }
        self.enable_link_state(udev, LpmState::U1);
        self.enable_link_state(udev, LpmState::U2);
    }

    fn ltm_applies(&self, udev: &Device) -> bool {
        udev.capabilities().root_ltm
            && udev
                .inner()
                .bos
                .as_ref()
                .is_some_and(|bos| bos.ltm_supported())
            && udev.active_config().is_some()
    }

    pub fn disable_ltm(&self, udev: &Device) -> Result<()> {
        if !self.ltm_applies(udev) {
            return Ok(());
        }
        udev.control_out(
            SetupPacket::clear_device_feature(DEVICE_LTM_ENABLE),
            self.config.control_timeout,
        )?;
        udev.inner().ltm_enabled = false;
        Ok(())
    }

    pub fn enable_ltm(&self, udev: &Device) {
        if !self.ltm_applies(udev) {
            return;
        }
        match udev.control_out(
            SetupPacket::set_device_feature(DEVICE_LTM_ENABLE),
            self.config.control_timeout,
        ) {
            Ok(()) => udev.inner().ltm_enabled = true,
            Err(err) => debug!(device = %udev.name(), error = %err, "LTM enable failed"),
        }
    }

    /// Switches USB 2 hardware LPM for a high-speed device that supports it.
    pub(crate) fn set_usb2_hw_lpm(&self, udev: &Device, enable: bool) -> Result<()> {
        if udev.speed() != Speed::High || !udev.lpm_capable() {
            return Ok(());
        }
        udev.controller.set_usb2_hw_lpm(udev, enable)?;
        udev.inner().usb2_hw_lpm_enabled = enable;
        Ok(())
    }
}
