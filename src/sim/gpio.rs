use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::DriverError;
use crate::gpio::{GpioDriver, IsrHandler, PinConfig, PinId};

type SharedIsr = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Pins {
    configs: HashMap<PinId, PinConfig>,
    levels: HashMap<PinId, bool>,
    handlers: HashMap<PinId, SharedIsr>,
    enables: HashMap<PinId, usize>,
    isr_service: bool,
}

/// Pin driver whose interrupts are raised by calling [`SimGpio::trigger`].
#[derive(Default)]
pub struct SimGpio {
    pins: Mutex<Pins>,
}

impl SimGpio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Pins> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_level(&self, pin: PinId, high: bool) {
        self.lock().levels.insert(pin, high);
    }

    pub fn config(&self, pin: PinId) -> Option<PinConfig> {
        self.lock().configs.get(&pin).copied()
    }

    /// How often the interrupt of `pin` was armed.
    pub fn interrupt_enables(&self, pin: PinId) -> usize {
        self.lock().enables.get(&pin).copied().unwrap_or(0)
    }

    /// Run the ISR attached to `pin`. False when none is attached.
    pub fn trigger(&self, pin: PinId) -> bool {
        // Called without the lock held, as the ISR may query the driver.
        let handler = self.lock().handlers.get(&pin).cloned();
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }
}

impl GpioDriver for SimGpio {
    fn configure(&self, pin: PinId, config: &PinConfig) -> Result<(), DriverError> {
        if !pin.is_valid() {
            return Err(DriverError::INVALID_ARG);
        }
        self.lock().configs.insert(pin, *config);
        Ok(())
    }

    fn install_isr_service(&self) -> Result<(), DriverError> {
        let mut pins = self.lock();
        if pins.isr_service {
            return Err(DriverError::INVALID_STATE);
        }
        pins.isr_service = true;
        Ok(())
    }

    fn add_isr_handler(&self, pin: PinId, handler: IsrHandler) -> Result<(), DriverError> {
        let mut pins = self.lock();
        if !pins.isr_service {
            return Err(DriverError::INVALID_STATE);
        }
        pins.handlers.insert(pin, Arc::from(handler));
        Ok(())
    }

    fn enable_interrupt(&self, pin: PinId) -> Result<(), DriverError> {
        let mut pins = self.lock();
        if !pins.handlers.contains_key(&pin) {
            return Err(DriverError::NOT_FOUND);
        }
        *pins.enables.entry(pin).or_default() += 1;
        Ok(())
    }

    fn remove_isr_handler(&self, pin: PinId) -> Result<(), DriverError> {
        match self.lock().handlers.remove(&pin) {
            Some(_) => Ok(()),
            None => Err(DriverError::NOT_FOUND),
        }
    }

    fn reset_pin(&self, pin: PinId) -> Result<(), DriverError> {
        let mut pins = self.lock();
        pins.configs.remove(&pin);
        pins.levels.remove(&pin);
        Ok(())
    }

    fn level(&self, pin: PinId) -> bool {
        self.lock().levels.get(&pin).copied().unwrap_or(false)
    }
}
