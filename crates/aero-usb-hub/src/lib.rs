//! Host-side USB hub port management.
//!
//! The engine owns the device tree of every registered bus and runs the hub event dispatcher:
//! it notices port connect/disconnect/enable/suspend/over-current changes, debounces
//! connections, resets and enumerates new devices, keeps bus power and link power management
//! in order, and suspends and resumes ports.
//!
//! The host controller and the outer device model are abstract:
//!
//! - [`HostController`]: control transfers, the hub status-change read, address and slot hooks
//! - [`DeviceRegistry`]: where enumerated devices are published for driver binding
//! - [`Clock`]: time and sleeping, so tests can drive the engine in virtual time
//!
//! Work is serialized per hub through a single dispatcher, which runs either on its own thread
//! ([`HubEngine::spawn_dispatcher`]) or synchronously ([`HubEngine::run_pending`]).

mod activate;
mod bits;
mod clock;
mod config;
mod connect;
mod debounce;
pub mod descriptor;
mod device;
mod devnum;
mod dispatcher;
mod engine;
mod enumerate;
mod error;
mod events;
mod hub;
mod indicator;
pub mod lpm;
mod pm;
mod port;
mod port_io;
pub mod power;
pub mod request;
mod reset;
pub mod status;
mod transport;
mod tt;

pub use activate::{ActivateKind, QuiesceKind};
pub use clock::{Clock, SystemClock};
pub use config::{DebounceConfig, HubConfig};
pub use descriptor::{Bos, ConfigDescriptor, DeviceDescriptor, HubDescriptor};
pub use device::{Device, DeviceState, LpmParams};
pub use engine::{Bus, HubEngine};
pub use enumerate::EnumStage;
pub use error::{HubError, RegistrationError, Result, TransferError};
pub use hub::{Hub, TtInfo, MAX_TOPO_LEVEL};
pub use indicator::IndicatorMode;
pub use lpm::LpmState;
pub use port::{Port, PortOwner, Removable};
pub use power::{PortBudget, PowerEvent};
pub use request::SetupPacket;
pub use status::{HubChange, HubStatus, LinkState, PortChange, PortFeature, PortStatus, Speed};
pub use transport::{DeviceRegistry, HostCapabilities, HostController, NullRegistry};
pub use tt::{tt_devinfo, TtClearRequest};
