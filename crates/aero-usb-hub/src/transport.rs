//! Seams to the host controller driver and to the device model.

use std::sync::Arc;
use std::time::Duration;

use crate::device::Device;
use crate::error::{RegistrationError, TransferError};
use crate::lpm::LpmState;
use crate::request::SetupPacket;
use crate::status::Speed;
use crate::tt::TtClearRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Speed of the root hub.
    pub root_speed: Speed,
    /// mA available on the root hub ports as a whole, or 0 if the controller reports none.
    pub power_budget_ma: u32,
    /// The controller is a USB 3 host; such controllers never use the 64-byte probe.
    pub usb3_host: bool,
    /// `enable_lpm_timeout` / `disable_lpm_timeout` are implemented.
    pub lpm_timeouts: bool,
    /// The root hub advertises Latency Tolerance Messaging.
    pub root_ltm: bool,
    /// Root port wired to the OTG connector.
    pub otg_port: Option<u8>,
    /// The controller assigns addresses itself (`address_device`) instead of `SET_ADDRESS`.
    pub addresses_devices: bool,
    /// Root hub U1 exit latency in µs, used when the root hub has no BOS.
    pub root_u1_exit_lat: u8,
    /// Root hub U2 exit latency in µs.
    pub root_u2_exit_lat: u16,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self {
            root_speed: Speed::High,
            power_budget_ma: 0,
            usb3_host: false,
            lpm_timeouts: false,
            root_ltm: false,
            otg_port: None,
            addresses_devices: false,
            root_u1_exit_lat: 0,
            root_u2_exit_lat: 0,
        }
    }
}

/// Host controller driver as seen by the hub engine.
///
/// Only `capabilities`, `control` and the status read hooks are mandatory. The rest default to
/// the behaviour of a controller that leaves those concerns to the hub engine.
pub trait HostController: Send + Sync {
    fn capabilities(&self) -> HostCapabilities;

    /// Runs one control transfer on `device`'s default pipe.
    ///
    /// Returns the number of bytes transferred in the data stage.
    fn control(
        &self,
        device: &Device,
        setup: SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError>;

    /// Arms the hub's interrupt-IN status endpoint. Completions are reported through
    /// [`crate::HubEngine::hub_irq`].
    fn submit_status_read(&self, hub_device: &Device) -> Result<(), TransferError>;

    fn cancel_status_read(&self, hub_device: &Device);

    fn alloc_device(&self, _device: &Device) -> Result<(), TransferError> {
        Ok(())
    }

    fn free_device(&self, _device: &Device) {}

    /// Only called when [`HostCapabilities::addresses_devices`] is set.
    fn address_device(&self, _device: &Device, _devnum: u8) -> Result<(), TransferError> {
        Err(TransferError::Protocol)
    }

    /// The device's address, ep0 size or hub status changed.
    fn update_device(&self, _device: &Device) {}

    /// The device was reset; controller state for it must be dropped.
    fn reset_device(&self, _device: &Device) -> Result<(), TransferError> {
        Ok(())
    }

    fn set_usb2_hw_lpm(&self, _device: &Device, _enable: bool) -> Result<(), TransferError> {
        Ok(())
    }

    /// Returns the U1/U2 timeout to program into the parent hub, 0 meaning "leave disabled".
    fn enable_lpm_timeout(&self, _device: &Device, _state: LpmState) -> Result<u16, TransferError> {
        Ok(0)
    }

    fn disable_lpm_timeout(&self, _device: &Device, _state: LpmState) -> Result<(), TransferError> {
        Ok(())
    }

    fn clear_tt_buffer_complete(&self, _request: &TtClearRequest) {}
}

/// Device-model collaborator: binds drivers and exposes devices once they are enumerated.
pub trait DeviceRegistry: Send + Sync {
    fn register_device(&self, device: &Arc<Device>) -> Result<(), RegistrationError>;

    fn unregister_device(&self, device: &Arc<Device>);
}

/// Registry that accepts everything and keeps nothing.
#[derive(Debug, Default)]
pub struct NullRegistry;

impl DeviceRegistry for NullRegistry {
    fn register_device(&self, _device: &Arc<Device>) -> Result<(), RegistrationError> {
        Ok(())
    }

    fn unregister_device(&self, _device: &Arc<Device>) {}
}
