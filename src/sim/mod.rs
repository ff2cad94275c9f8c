//! Host backend.
//!
//! Stands in for the ESP-IDF drivers when building for anything other than
//! the device, so the provisioning flow can run and be tested on a PC.

mod events;
mod gpio;
mod smartconfig;
mod storage;
mod wifi;

use std::sync::Arc;

pub use events::SimEventLoop;
pub use gpio::SimGpio;
pub use smartconfig::SimSmartConfig;
pub use storage::MemoryStore;
pub use wifi::{SimWifiDriver, WifiCall};

use crate::gpio::PinRegistry;
use crate::runtime::{Runtime, Services};

/// One simulated board: every backend plus the runtime and pin registry
/// built on top of them.
pub struct SimServices {
    pub events: Arc<SimEventLoop>,
    pub wifi: Arc<SimWifiDriver>,
    pub storage: MemoryStore,
    pub smartconfig: Arc<SimSmartConfig>,
    pub gpio: Arc<SimGpio>,
    runtime: Arc<Runtime>,
    registry: Arc<PinRegistry>,
}

impl SimServices {
    pub fn new() -> Self {
        let events = SimEventLoop::new();
        let wifi = SimWifiDriver::new(events.clone());
        let storage = MemoryStore::new();
        let smartconfig = SimSmartConfig::new(events.clone());
        let gpio = SimGpio::new();

        let runtime = Runtime::new(Services {
            wifi: wifi.clone(),
            events: events.clone(),
            storage: Arc::new(storage.clone()),
            smartconfig: smartconfig.clone(),
        });
        let registry = PinRegistry::new(gpio.clone());

        Self {
            events,
            wifi,
            storage,
            smartconfig,
            gpio,
            runtime,
            registry,
        }
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.clone()
    }

    pub fn registry(&self) -> Arc<PinRegistry> {
        self.registry.clone()
    }

    pub fn services(&self) -> Services {
        self.runtime.services().clone()
    }
}

impl Default for SimServices {
    fn default() -> Self {
        Self::new()
    }
}
