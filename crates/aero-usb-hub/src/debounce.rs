//! Connection debouncing (USB 2.0 §7.1.7.3).

use std::time::Duration;

use tracing::debug;

use crate::engine::HubEngine;
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::status::{PortChange, PortFeature, PortStatus};

impl HubEngine {
    /// Polls `port` until its connection bit has held still for the stable interval.
    ///
    /// With `must_be_connected`, only connected time counts towards stability. Returns the last
    /// status read, or `Timeout` once the debounce window is exhausted.
    pub fn port_debounce(&self, hub: &Hub, port: u8, must_be_connected: bool) -> Result<PortStatus> {
        let cfg = self.config.debounce;
        let mut total = Duration::ZERO;
        let mut stable = Duration::ZERO;
        let mut connection: Option<bool> = None;
        let mut status;

        loop {
            let (s, change) = self.port_status(hub, port)?;
            status = s;
            let connected = status.contains(PortStatus::CONNECTION);

            if !change.contains(PortChange::CONNECTION) && connection == Some(connected) {
                if !must_be_connected || connected {
                    stable += cfg.step;
                }
                if stable >= cfg.stable {
                    break;
                }
            } else {
                stable = Duration::ZERO;
                connection = Some(connected);
            }

            if change.contains(PortChange::CONNECTION) {
                let _ = self.clear_port_feature(hub, port, PortFeature::CConnection);
            }

            if total >= cfg.timeout {
                break;
            }
            self.sleep(cfg.step);
            total += cfg.step;
        }

        debug!(
            hub = %hub.name(),
            port,
            total_ms = total.as_millis() as u64,
            stable_ms = stable.as_millis() as u64,
            ?status,
            "debounce"
        );

        if stable < cfg.stable {
            return Err(HubError::Timeout("port debounce"));
        }
        Ok(status)
    }
}
