use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use esp_idf_svc::hal::gpio::{
    self, AnyIOPin, AnyInputPin, AnyOutputPin, Input, InputOutput, Output, PinDriver, Pull,
};
use log::warn;

use crate::error::DriverError;
use crate::gpio::{GpioDriver, InterruptType, IsrHandler, PinConfig, PinId, PinMode};

// GPIO34-39 are input only and have no pull resistors.
const fn is_input_only(pin: PinId) -> bool {
    matches!(pin.0, 34..=39)
}

fn pull(config: &PinConfig) -> Pull {
    match (config.pull_up, config.pull_down) {
        (true, true) => Pull::UpDown,
        (true, false) => Pull::Up,
        (false, true) => Pull::Down,
        (false, false) => Pull::Floating,
    }
}

fn trigger(interrupt: InterruptType) -> Option<gpio::InterruptType> {
    match interrupt {
        InterruptType::Disable => None,
        InterruptType::PosEdge => Some(gpio::InterruptType::PosEdge),
        InterruptType::NegEdge => Some(gpio::InterruptType::NegEdge),
        InterruptType::AnyEdge => Some(gpio::InterruptType::AnyEdge),
        InterruptType::LowLevel => Some(gpio::InterruptType::LowLevel),
        InterruptType::HighLevel => Some(gpio::InterruptType::HighLevel),
    }
}

/// One configured pin. Dropping it resets the pin.
enum Driver {
    Disabled(PinDriver<'static, AnyIOPin, gpio::Disabled>),
    Input(PinDriver<'static, AnyIOPin, Input>),
    InputOnly(PinDriver<'static, AnyInputPin, Input>),
    Output(PinDriver<'static, AnyOutputPin, Output>),
    InputOutput(PinDriver<'static, AnyIOPin, InputOutput>),
}

impl Driver {
    fn new(pin: PinId, config: &PinConfig) -> Result<Self, DriverError> {
        let interrupt = trigger(config.interrupt);

        // The registry hands each pin to one driver at a time.
        let driver = match config.mode {
            PinMode::Disabled => {
                Self::Disabled(PinDriver::disabled(unsafe { AnyIOPin::new(pin.0 as _) })?)
            }
            PinMode::Input if is_input_only(pin) => {
                if config.pull_up || config.pull_down {
                    warn!("{} has no internal pull resistors, pull ignored", pin);
                }
                let mut input = PinDriver::input(unsafe { AnyInputPin::new(pin.0 as _) })?;
                if let Some(interrupt) = interrupt {
                    input.set_interrupt_type(interrupt)?;
                }
                Self::InputOnly(input)
            }
            PinMode::Input => {
                let mut input = PinDriver::input(unsafe { AnyIOPin::new(pin.0 as _) })?;
                input.set_pull(pull(config))?;
                if let Some(interrupt) = interrupt {
                    input.set_interrupt_type(interrupt)?;
                }
                Self::Input(input)
            }
            PinMode::Output => {
                if interrupt.is_some() {
                    return Err(DriverError::INVALID_ARG);
                }
                Self::Output(PinDriver::output(unsafe { AnyOutputPin::new(pin.0 as _) })?)
            }
            PinMode::InputOutput | PinMode::OutputOpenDrain => {
                let io_pin = unsafe { AnyIOPin::new(pin.0 as _) };
                let mut io = if config.mode == PinMode::OutputOpenDrain {
                    PinDriver::input_output_od(io_pin)?
                } else {
                    PinDriver::input_output(io_pin)?
                };
                io.set_pull(pull(config))?;
                if let Some(interrupt) = interrupt {
                    io.set_interrupt_type(interrupt)?;
                }
                Self::InputOutput(io)
            }
        };
        Ok(driver)
    }

    fn subscribe(&mut self, handler: IsrHandler) -> Result<(), DriverError> {
        let callback = move || handler();

        // The handler runs in interrupt context; it never blocks, allocates or logs.
        match self {
            Self::Input(d) => unsafe { d.subscribe(callback) }?,
            Self::InputOnly(d) => unsafe { d.subscribe(callback) }?,
            Self::InputOutput(d) => unsafe { d.subscribe(callback) }?,
            Self::Disabled(_) | Self::Output(_) => return Err(DriverError::INVALID_STATE),
        }
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<(), DriverError> {
        match self {
            Self::Input(d) => d.unsubscribe()?,
            Self::InputOnly(d) => d.unsubscribe()?,
            Self::InputOutput(d) => d.unsubscribe()?,
            Self::Disabled(_) | Self::Output(_) => return Err(DriverError::NOT_FOUND),
        }
        Ok(())
    }

    fn enable_interrupt(&mut self) -> Result<(), DriverError> {
        match self {
            Self::Input(d) => d.enable_interrupt()?,
            Self::InputOnly(d) => d.enable_interrupt()?,
            Self::InputOutput(d) => d.enable_interrupt()?,
            Self::Disabled(_) | Self::Output(_) => return Err(DriverError::INVALID_STATE),
        }
        Ok(())
    }

    fn is_high(&self) -> bool {
        match self {
            Self::Input(d) => d.is_high(),
            Self::InputOnly(d) => d.is_high(),
            Self::InputOutput(d) => d.is_high(),
            Self::Output(d) => d.is_set_high(),
            Self::Disabled(_) => false,
        }
    }
}

/// Pins driven through esp-idf-hal's [`PinDriver`], one per configured pin.
#[derive(Default)]
pub struct EspGpio {
    pins: Mutex<HashMap<PinId, Driver>>,
}

impl EspGpio {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PinId, Driver>> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_pin<R>(
        &self,
        pin: PinId,
        f: impl FnOnce(&mut Driver) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        let mut pins = self.lock();
        let driver = pins.get_mut(&pin).ok_or(DriverError::NOT_FOUND)?;
        f(driver)
    }
}

impl GpioDriver for EspGpio {
    fn configure(&self, pin: PinId, config: &PinConfig) -> Result<(), DriverError> {
        // Reset any previous driver first; dropping it later would undo this config.
        drop(self.lock().remove(&pin));

        let driver = Driver::new(pin, config)?;
        self.lock().insert(pin, driver);
        Ok(())
    }

    // PinDriver::subscribe installs the shared ISR service on first use.
    fn install_isr_service(&self) -> Result<(), DriverError> {
        Ok(())
    }

    fn add_isr_handler(&self, pin: PinId, handler: IsrHandler) -> Result<(), DriverError> {
        self.with_pin(pin, |driver| driver.subscribe(handler))
    }

    fn enable_interrupt(&self, pin: PinId) -> Result<(), DriverError> {
        self.with_pin(pin, Driver::enable_interrupt)
    }

    fn remove_isr_handler(&self, pin: PinId) -> Result<(), DriverError> {
        self.with_pin(pin, Driver::unsubscribe)
    }

    fn reset_pin(&self, pin: PinId) -> Result<(), DriverError> {
        drop(self.lock().remove(&pin));
        Ok(())
    }

    fn level(&self, pin: PinId) -> bool {
        self.lock().get(&pin).is_some_and(Driver::is_high)
    }
}
