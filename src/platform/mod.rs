//! ESP-IDF backend: the collaborator seams implemented on esp-idf-svc and
//! esp-idf-hal, with raw `sys` calls where those have no wrapper
//! (SmartConfig, the event handler instances).

mod events;
mod gpio;
mod nvs;
mod smartconfig;
mod wifi;

use std::sync::Arc;

use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::{esp_err_t, ESP_OK};

pub use events::EspEventBus;
pub use gpio::EspGpio;
pub use nvs::EspKeyValueStore;
pub use smartconfig::EspSmartConfig;
pub use wifi::EspWifiDriver;

use crate::error::DriverError;
use crate::gpio::PinRegistry;
use crate::runtime::{Runtime, Services};

pub(crate) fn check(code: esp_err_t) -> Result<(), DriverError> {
    if code == ESP_OK {
        Ok(())
    } else {
        Err(DriverError::from_code(code))
    }
}

/// Build the runtime and pin registry on the device drivers.
pub fn take(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
) -> (Arc<Runtime>, Arc<PinRegistry>) {
    let runtime = Runtime::new(Services {
        wifi: Arc::new(EspWifiDriver::new(modem, sys_loop, nvs.clone())),
        events: Arc::new(EspEventBus::new()),
        storage: Arc::new(EspKeyValueStore::new(nvs)),
        smartconfig: Arc::new(EspSmartConfig),
    });
    let registry = PinRegistry::new(Arc::new(EspGpio::new()));
    (runtime, registry)
}
