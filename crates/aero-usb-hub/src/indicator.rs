//! Port indicator LEDs (USB 2.0 §11.5.3).

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::device::DeviceState;
use crate::engine::HubEngine;
use crate::events::Deferred;
use crate::hub::Hub;
use crate::status::{INDICATOR_AMBER, INDICATOR_AUTO, INDICATOR_GREEN, INDICATOR_OFF};

pub(crate) const LED_CYCLE_PERIOD: Duration = Duration::from_millis(666);

/// Software-driven indicator state of one port. Blink modes toggle on each LED tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorMode {
    Auto,
    /// Position of the blinkenlights cursor.
    Cycle,
    /// Software attention.
    GreenBlink,
    GreenBlinkOff,
    /// Hardware attention.
    AmberBlink,
    AmberBlinkOff,
    AltBlink,
    AltBlinkOff,
}

impl IndicatorMode {
    /// The selector to drive now and the mode for the next tick, or `None` for a port left to
    /// the hub.
    fn step(self) -> Option<(u8, IndicatorMode)> {
        use IndicatorMode::*;
        Some(match self {
            Auto => return None,
            Cycle => (INDICATOR_AUTO, Auto),
            GreenBlink => (INDICATOR_GREEN, GreenBlinkOff),
            GreenBlinkOff => (INDICATOR_OFF, GreenBlink),
            AmberBlink => (INDICATOR_AMBER, AmberBlinkOff),
            AmberBlinkOff => (INDICATOR_OFF, AmberBlink),
            AltBlink => (INDICATOR_GREEN, AltBlinkOff),
            AltBlinkOff => (INDICATOR_AMBER, AltBlink),
        })
    }
}

fn selector_name(selector: u8) -> &'static str {
    match selector {
        INDICATOR_AMBER => "amber",
        INDICATOR_GREEN => "green",
        INDICATOR_OFF => "off",
        INDICATOR_AUTO => "auto",
        _ => "??",
    }
}

impl HubEngine {
    pub(crate) fn set_indicator_mode(&self, hub: &Hub, port: u8, mode: IndicatorMode) {
        let Some(index) = port.checked_sub(1) else {
            return;
        };
        if let Some(slot) = hub.indicators_mut().get_mut(index as usize) {
            *slot = mode;
        }
    }

    /// Runs the LED worker on the next dispatcher turn.
    pub(crate) fn schedule_leds_now(&self, hub: &Arc<Hub>) {
        self.queue.cancel(hub, |work| work == Deferred::Leds);
        self.queue.schedule(hub, Deferred::Leds, self.clock.now());
    }

    fn set_port_led(&self, hub: &Hub, port: u8, selector: u8) {
        if let Err(err) = self.set_port_indicator(hub, port, selector) {
            debug!(hub = %hub.name(), port, indicator = selector_name(selector), error = %err, "port indicator request failed");
        }
    }

    pub(crate) fn led_work(&self, hub: &Arc<Hub>) {
        let configured = hub
            .hdev()
            .is_some_and(|hdev| hdev.state() == DeviceState::Configured);
        if !configured || hub.is_quiescing() {
            return;
        }

        let mut changed = false;
        let mut cursor: Option<u8> = None;
        for port in 1..=hub.num_ports() {
            let Some(mode) = hub.indicator(port) else {
                continue;
            };
            let Some((selector, next)) = mode.step() else {
                continue;
            };
            if mode == IndicatorMode::Cycle {
                cursor = Some(port - 1);
            }
            if selector != INDICATOR_AUTO {
                changed = true;
            }
            self.set_port_led(hub, port, selector);
            self.set_indicator_mode(hub, port, next);
        }

        if !changed && self.config.blinkenlights && hub.num_ports() > 0 {
            let next = cursor.map_or(0, |c| (c + 1) % hub.num_ports()) + 1;
            self.set_port_led(hub, next, INDICATOR_GREEN);
            self.set_indicator_mode(hub, next, IndicatorMode::Cycle);
            changed = true;
        }
        if changed {
            self.queue
                .schedule(hub, Deferred::Leds, self.clock.now() + LED_CYCLE_PERIOD);
        }
    }
}
