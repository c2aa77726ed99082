//! Engine tunables.
//!
//! Timing constants fixed by the USB specification live next to the code that uses them. The
//! values here are policy knobs that a host may want to change, e.g. to try the old enumeration
//! scheme first for a stubborn device or to widen the debounce window.

use std::time::Duration;

/// Debounce polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Interval between port status polls.
    pub step: Duration,
    /// How long the connection bit must hold still before the port counts as settled.
    pub stable: Duration,
    /// Give up after this much polling.
    pub timeout: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(25),
            stable: Duration::from_millis(100),
            timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Start enumeration with the old (address-first) scheme.
    pub old_scheme_first: bool,
    /// Fall back to the other scheme after the first scheme failed twice.
    pub use_both_schemes: bool,
    /// Cycle a green LED across idle ports of hubs with indicators.
    pub blinkenlights: bool,
    pub initial_descriptor_timeout: Duration,
    pub control_timeout: Duration,
    pub debounce: DebounceConfig,
    /// Keep device objects across power loss and verify them with a reset-resume.
    pub persist: bool,
    /// Attempts for a hub or port GET_STATUS that times out or stalls.
    pub status_retries: u32,
    /// Configure and probe hub devices as soon as they are registered.
    pub bind_hubs: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            old_scheme_first: false,
            use_both_schemes: true,
            blinkenlights: false,
            initial_descriptor_timeout: Duration::from_secs(5),
            control_timeout: Duration::from_secs(5),
            debounce: DebounceConfig::default(),
            persist: true,
            status_retries: 5,
            bind_hubs: true,
        }
    }
}

impl HubConfig {
    /// Reads overrides from `AERO_USB_HUB_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        let flag = |name: &str, current: bool| match lookup(name) {
            Some(raw) => parse_truthy(&raw),
            None => current,
        };
        let millis = |name: &str, current: Duration| {
            lookup(name)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(current)
        };

        cfg.old_scheme_first = flag("AERO_USB_HUB_OLD_SCHEME_FIRST", cfg.old_scheme_first);
        cfg.use_both_schemes = flag("AERO_USB_HUB_USE_BOTH_SCHEMES", cfg.use_both_schemes);
        cfg.blinkenlights = flag("AERO_USB_HUB_BLINKENLIGHTS", cfg.blinkenlights);
        cfg.persist = flag("AERO_USB_HUB_PERSIST", cfg.persist);
        cfg.bind_hubs = flag("AERO_USB_HUB_BIND_HUBS", cfg.bind_hubs);

        cfg.initial_descriptor_timeout = millis(
            "AERO_USB_HUB_INITIAL_DESCRIPTOR_TIMEOUT_MS",
            cfg.initial_descriptor_timeout,
        );
        cfg.control_timeout = millis("AERO_USB_HUB_CONTROL_TIMEOUT_MS", cfg.control_timeout);
        cfg.debounce.timeout = millis("AERO_USB_HUB_DEBOUNCE_TIMEOUT_MS", cfg.debounce.timeout);

        if let Some(retries) =
            lookup("AERO_USB_HUB_STATUS_RETRIES").and_then(|raw| raw.trim().parse::<u32>().ok())
        {
            cfg.status_retries = retries.max(1);
        }

        cfg
    }
}

fn parse_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
