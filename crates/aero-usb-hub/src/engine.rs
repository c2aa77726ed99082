//! The engine object: buses, the device tree lock, the event queue and its worker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::HubConfig;
use crate::device::{Device, DeviceState};
use crate::devnum::DevnumMap;
use crate::error::{HubError, Result};
use crate::events::{Deferred, EventQueue};
use crate::hub::Hub;
use crate::power::PowerEvent;
use crate::status::Speed;
use crate::transport::{DeviceRegistry, HostCapabilities, HostController};

/// Devnum 1 always belongs to the root hub.
const ROOT_HUB_DEVNUM: u8 = 1;

/// One host controller and the address space of the devices behind it.
pub struct Bus {
    pub(crate) id: u32,
    pub(crate) controller: Arc<dyn HostController>,
    pub(crate) caps: HostCapabilities,
    devmap: Mutex<DevnumMap>,
    root: Mutex<Option<Arc<Device>>>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id)
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

impl Bus {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn capabilities(&self) -> HostCapabilities {
        self.caps
    }

    pub fn root_hub(&self) -> Option<Arc<Device>> {
        self.root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn devmap(&self) -> MutexGuard<'_, DevnumMap> {
        self.devmap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocates the next free bus address, round-robin.
    pub fn choose_devnum(&self) -> Result<u8> {
        self.devmap()
            .alloc()
            .ok_or(HubError::ResourceExhausted("no free bus address"))
    }

    pub fn release_devnum(&self, devnum: u8) {
        self.devmap().release(devnum);
    }

    pub fn addresses_in_use(&self) -> u32 {
        self.devmap().in_use()
    }
}

pub struct HubEngine {
    pub(crate) config: HubConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) registry: Arc<dyn DeviceRegistry>,
    tree_lock: Mutex<()>,
    pub(crate) queue: EventQueue,
    buses: Mutex<Vec<Arc<Bus>>>,
    next_bus_id: AtomicU32,
    power_events: Mutex<Vec<PowerEvent>>,
    /// Configured high-speed hubs; a full-speed device that could run at high speed is told so
    /// only when one exists.
    pub(crate) highspeed_hubs: AtomicU32,
}

impl std::fmt::Debug for HubEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HubEngine {
    pub fn new(
        config: HubConfig,
        clock: Arc<dyn Clock>,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            registry,
            tree_lock: Mutex::new(()),
            queue: EventQueue::default(),
            buses: Mutex::new(Vec::new()),
            next_bus_id: AtomicU32::new(1),
            power_events: Mutex::new(Vec::new()),
            highspeed_hubs: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The short-held lock guarding device state transitions and child pointers.
    pub(crate) fn lock_tree(&self) -> MutexGuard<'_, ()> {
        self.tree_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration);
    }

    pub fn buses(&self) -> Vec<Arc<Bus>> {
        self.buses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn root_hub(&self, bus: &Bus) -> Option<Arc<Device>> {
        bus.root_hub()
    }

    /// Registers a host controller and enumerates its root hub.
    pub fn add_bus(&self, controller: Arc<dyn HostController>) -> Result<Arc<Bus>> {
        let caps = controller.capabilities();
        let id = self.next_bus_id.fetch_add(1, Ordering::AcqRel);
        let bus = Arc::new(Bus {
            id,
            controller,
            caps,
            devmap: Mutex::new(DevnumMap::new()),
            root: Mutex::new(None),
        });
        bus.devmap().reserve(ROOT_HUB_DEVNUM);

        let root = Device::new_root(&bus, caps.root_speed, self.config.persist);
        {
            let mut inner = root.inner();
            inner.devnum = ROOT_HUB_DEVNUM;
            inner.bus_ma = caps.power_budget_ma;
            inner.ep0_maxpacket = if caps.root_speed == Speed::Super { 512 } else { 64 };
        }
        self.set_device_state(&root, DeviceState::Address);
        *bus
            .root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(root.clone());
        self.buses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(bus.clone());

        let registered = self.read_device_descriptor(&root).and_then(|()| {
            if let Err(err) = self.read_bos(&root) {
                debug!(bus = id, error = %err, "root hub has no usable BOS");
            }
            self.new_device(&root)
        });
        if let Err(err) = registered {
            error!(bus = id, error = %err, "can't register root hub");
            self.remove_bus(&bus);
            return Err(err);
        }
        info!(bus = id, speed = ?caps.root_speed, "new USB bus registered");
        Ok(bus)
    }

    /// Tears down every device on `bus`, root hub included.
    pub fn remove_bus(&self, bus: &Arc<Bus>) {
        let root = bus
            .root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(root) = root {
            self.disconnect_device(&root);
        }
        self.buses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|b| !Arc::ptr_eq(b, bus));
        info!(bus = bus.id, "USB bus removed");
    }

    pub(crate) fn push_power_event(&self, event: PowerEvent) {
        self.power_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    /// Drains the power budget diagnostics recorded since the last call.
    pub fn take_power_events(&self) -> Vec<PowerEvent> {
        std::mem::take(
            &mut *self
                .power_events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Runs due deferred work and every queued hub, without waiting. Returns the number of items
    /// processed.
    pub fn run_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            if let Some((hub, work)) = self.queue.take_due(self.clock.now()) {
                self.run_deferred(&hub, work);
                handled += 1;
                continue;
            }
            match self.queue.pop() {
                Some(hub) => {
                    self.hub_event(hub);
                    handled += 1;
                }
                None => return handled,
            }
        }
    }

    /// Like [`run_pending`](Self::run_pending), but also sleeps the engine clock up to each
    /// deferred deadline that falls within `max_wait`.
    pub fn run_until_idle(&self, max_wait: Duration) -> usize {
        let deadline = self.clock.now() + max_wait;
        let mut handled = 0;
        loop {
            handled += self.run_pending();
            match self.queue.next_due() {
                Some(due) if due <= deadline => {
                    let now = self.clock.now();
                    if due > now {
                        self.clock.sleep(due - now);
                    }
                }
                _ => return handled,
            }
        }
    }

    /// Whether any hub is queued or any deferred work is armed.
    pub fn has_pending_work(&self) -> bool {
        self.queue.has_hubs() || self.queue.next_due().is_some()
    }

    /// Starts the dispatcher thread. It runs until [`shutdown`](Self::shutdown).
    pub fn spawn_dispatcher(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("aero-usb-hub".to_string())
            .spawn(move || {
                debug!("hub dispatcher started");
                while !engine.queue.is_shutdown() {
                    engine.run_pending();
                    let timeout = engine
                        .queue
                        .next_due()
                        .map(|due| due.saturating_sub(engine.clock.now()));
                    engine.queue.wait(timeout);
                }
                debug!("hub dispatcher stopped");
            })
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    fn run_deferred(&self, hub: &Arc<Hub>, work: Deferred) {
        match work {
            Deferred::Activate(kind) => {
                let Some(hdev) = hub.hdev() else {
                    return;
                };
                let _guard = hdev.lock_device();
                if hub.is_disconnected() {
                    return;
                }
                self.activate(hub, kind);
            }
            Deferred::Leds => self.led_work(hub),
            Deferred::TtClear => self.tt_work(hub),
        }
    }
}
