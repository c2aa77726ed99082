//! Bus power budgeting (USB 2.0 §7.2.1, USB 3.0 §9.2.5.1).

use tracing::warn;

use crate::engine::HubEngine;
use crate::hub::Hub;

const UNIT_LOAD_MA: u32 = 100;
const FULL_LOAD_MA: u32 = 500;
const SS_UNIT_LOAD_MA: u32 = 150;
const SS_FULL_LOAD_MA: u32 = 900;

/// What an unconfigured OTG B-device may draw from the root port.
const OTG_UNCONFIGURED_MA: u32 = 8;

pub fn unit_load(superspeed: bool) -> u32 {
    if superspeed {
        SS_UNIT_LOAD_MA
    } else {
        UNIT_LOAD_MA
    }
}

pub fn full_load(superspeed: bool) -> u32 {
    if superspeed {
        SS_FULL_LOAD_MA
    } else {
        FULL_LOAD_MA
    }
}

/// Per-port allotment of a hub, decided once at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBudget {
    pub ma_per_port: u32,
    /// The hub's downstream power is finite and has to be accounted for.
    pub limited: bool,
    /// Not even a unit load per port is available.
    pub insufficient: bool,
}

pub fn root_hub_budget(superspeed: bool, bus_ma: u32) -> PortBudget {
    let full = full_load(superspeed);
    if bus_ma == 0 || bus_ma >= full {
        PortBudget {
            ma_per_port: full,
            limited: false,
            insufficient: false,
        }
    } else {
        PortBudget {
            ma_per_port: bus_ma,
            limited: true,
            insufficient: false,
        }
    }
}

/// A bus-powered hub hands each port a single unit load out of what its upstream port supplies.
pub fn bus_powered_budget(
    superspeed: bool,
    bus_ma: u32,
    hub_contr_current: u32,
    num_ports: u8,
) -> PortBudget {
    let unit = unit_load(superspeed);
    let remaining = i64::from(bus_ma) - i64::from(hub_contr_current);
    PortBudget {
        ma_per_port: unit,
        limited: true,
        insufficient: remaining < i64::from(num_ports) * i64::from(unit),
    }
}

pub fn self_powered_budget(superspeed: bool) -> PortBudget {
    PortBudget {
        ma_per_port: full_load(superspeed),
        limited: false,
        insufficient: false,
    }
}

/// Budget diagnostics. None of these stop a device from being used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerEvent {
    /// A child's configuration draws more than its port's allotment.
    OverBudget {
        hub: String,
        port: u8,
        draw_ma: u32,
        budget_ma: u32,
    },
    /// The children of a limited hub draw more than its upstream supply.
    OverCommitted { hub: String, over_ma: u32 },
    /// A bus-powered hub cannot give every downstream port a unit load.
    InsufficientPower {
        hub: String,
        available_ma: u32,
        ports: u8,
    },
}

impl HubEngine {
    /// mA left on a limited-power hub after its own controller and every attached child, or 0
    /// for hubs with ample power.
    pub fn power_remaining(&self, hub: &Hub) -> i32 {
        if !hub.limited_power() {
            return 0;
        }
        let Some(hdev) = hub.hdev() else {
            return 0;
        };
        let otg_port = hdev.capabilities().otg_port;
        let budget = hub.ma_per_port();

        let mut remaining =
            i64::from(hdev.bus_ma()) - i64::from(hub.descriptor.hub_contr_current);
        for port in &hub.ports {
            let Some(child) = port.child() else {
                continue;
            };
            let superspeed = child.speed().is_superspeed();
            let max_power = child.inner().active_config().map(|c| c.max_power);
            let draw = match max_power {
                Some(max_power) => u32::from(max_power) * if superspeed { 8 } else { 2 },
                None if hdev.is_root_hub() && otg_port == Some(port.number()) => {
                    OTG_UNCONFIGURED_MA
                }
                None => unit_load(superspeed),
            };
            if draw > budget {
                warn!(
                    device = %child.name(),
                    port = port.number(),
                    draw_ma = draw,
                    budget_ma = budget,
                    "over budget for port"
                );
                self.push_power_event(PowerEvent::OverBudget {
                    hub: hub.name().to_string(),
                    port: port.number(),
                    draw_ma: draw,
                    budget_ma: budget,
                });
            }
            remaining -= i64::from(draw);
        }

        if remaining < 0 {
            let over = u32::try_from(-remaining).unwrap_or(u32::MAX);
            warn!(hub = %hub.name(), over_ma = over, "over power budget");
            self.push_power_event(PowerEvent::OverCommitted {
                hub: hub.name().to_string(),
                over_ma: over,
            });
            return 0;
        }
        i32::try_from(remaining).unwrap_or(i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_hub_without_a_budget_gets_full_load() {
        assert_eq!(
            root_hub_budget(false, 0),
            PortBudget {
                ma_per_port: 500,
                limited: false,
                insufficient: false
            }
        );
        assert_eq!(root_hub_budget(true, 4500).ma_per_port, 900);
    }

    #[test]
    fn small_root_budget_limits_every_port() {
        let budget = root_hub_budget(false, 100);
        assert_eq!(budget.ma_per_port, 100);
        assert!(budget.limited);
    }

    #[test]
    fn bus_powered_hub_gives_unit_loads() {
        let budget = bus_powered_budget(false, 500, 100, 4);
        assert_eq!(budget.ma_per_port, 100);
        assert!(budget.limited);
        assert!(!budget.insufficient);

        assert!(bus_powered_budget(false, 500, 150, 4).insufficient);
        assert_eq!(bus_powered_budget(true, 900, 0, 4).ma_per_port, 150);
    }

    #[test]
    fn self_powered_hub_is_not_limited() {
        let budget = self_powered_budget(true);
        assert_eq!(budget.ma_per_port, 900);
        assert!(!budget.limited);
    }
}
