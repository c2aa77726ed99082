//! Transaction translator buffer recovery (USB 2.0 §11.24.2.3).
//!
//! When a split transaction to a full/low-speed device stalls or times out, the TT that carried
//! it may still hold a busy buffer for that endpoint. The host controller reports the failed
//! endpoint through [`HubEngine::clear_tt_buffer`]; the request is queued on the hub that owns
//! the TT and issued from the dispatcher.

use std::collections::VecDeque;
use std::sync::{Arc, MutexGuard};

use tracing::error;

use crate::device::Device;
use crate::engine::HubEngine;
use crate::error::{HubError, Result};
use crate::events::Deferred;
use crate::hub::Hub;
use crate::request::SetupPacket;

const XFER_CONTROL: u16 = 0;
const XFER_BULK: u16 = 2;

/// One pending `CLEAR_TT_BUFFER`.
#[derive(Debug, Clone)]
pub struct TtClearRequest {
    /// `wValue`: endpoint, device address, endpoint type and direction.
    pub devinfo: u16,
    /// `wIndex`: the TT port, 1 for single-TT hubs.
    pub tt: u16,
    /// Endpoint address as the controller knows it (direction in bit 7).
    pub endpoint: u8,
    pub device: Arc<Device>,
}

/// Packs the `CLEAR_TT_BUFFER` device info word. Every non-control endpoint is reported as bulk.
pub fn tt_devinfo(endpoint: u8, devnum: u8, control: bool) -> u16 {
    let mut devinfo = u16::from(endpoint & 0x0f);
    devinfo |= u16::from(devnum & 0x7f) << 4;
    let xfer = if control { XFER_CONTROL } else { XFER_BULK };
    devinfo |= xfer << 11;
    if endpoint & 0x80 != 0 {
        devinfo |= 1 << 15;
    }
    devinfo
}

impl Hub {
    fn tt_clear_list(&self) -> MutexGuard<'_, VecDeque<TtClearRequest>> {
        self.tt_clear
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pending_tt_clears(&self) -> usize {
        self.tt_clear_list().len()
    }
}

impl HubEngine {
    /// Queues a buffer clear for `endpoint` of `device` on the TT serving it.
    ///
    /// `control` selects the control endpoint encoding, for which both directions are cleared.
    pub fn clear_tt_buffer(&self, device: &Arc<Device>, endpoint: u8, control: bool) -> Result<()> {
        let (link, devnum) = {
            let inner = device.inner();
            (inner.tt.clone(), inner.devnum)
        };
        let Some(link) = link else {
            return Err(HubError::NoDevice);
        };
        let Some(hub) = link.hub.upgrade() else {
            return Err(HubError::NoDevice);
        };
        let multi = hub.tt().is_some_and(|tt| tt.multi);

        let request = TtClearRequest {
            devinfo: tt_devinfo(endpoint, devnum, control),
            tt: if multi { u16::from(link.port) } else { 1 },
            endpoint,
            device: device.clone(),
        };
        hub.tt_clear_list().push_back(request);
        self.queue.schedule(&hub, Deferred::TtClear, self.clock.now());
        Ok(())
    }

    fn send_clear_tt_buffer(&self, hdev: &Device, devinfo: u16, tt: u16) -> Result<()> {
        if (devinfo >> 11) & 0x3 == XFER_CONTROL {
            hdev.control_out(
                SetupPacket::clear_tt_buffer(devinfo ^ 0x8000, tt),
                self.config.control_timeout,
            )?;
        }
        hdev.control_out(
            SetupPacket::clear_tt_buffer(devinfo, tt),
            self.config.control_timeout,
        )
    }

    /// Drains `hub`'s clear list in order. The list lock is not held during transfers, so the
    /// controller may report further failures meanwhile.
    pub(crate) fn tt_work(&self, hub: &Arc<Hub>) {
        loop {
            let Some(request) = hub.tt_clear_list().pop_front() else {
                return;
            };
            let result = match hub.hdev() {
                Some(hdev) => self.send_clear_tt_buffer(&hdev, request.devinfo, request.tt),
                None => Err(HubError::NoDevice),
            };
            if let Err(err) = result {
                if !err.is_no_device() {
                    error!(
                        hub = %hub.name(),
                        tt = request.tt,
                        devinfo = format_args!("{:04x}", request.devinfo),
                        error = %err,
                        "clear tt error"
                    );
                }
            }
            request.device.controller.clear_tt_buffer_complete(&request);
        }
    }
}
