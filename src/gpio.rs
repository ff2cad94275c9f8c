//! GPIO pin registry and ISR bridge.
//!
//! The [`PinRegistry`] tracks which pins are claimed and how each one was
//! configured. A [`Gpio`] guard claims one pin for as long as it lives; when
//! given an ISR function it also owns the handoff queue the ISR feeds.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::{debug, info, warn};

use crate::error::{tolerate_invalid_state, DriverError};
use crate::sync::HandoffQueue;

/// An ESP32 GPIO number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinId(pub u8);

// Arduino UNO header names on ESP32 UNO-form-factor boards.
const ARDUINO_PINS: [(&str, u8); 20] = [
    ("D2", 26),
    ("D3", 25),
    ("D4", 17),
    ("D5", 16),
    ("D6", 27),
    ("D7", 14),
    ("D8", 12),
    ("D9", 13),
    ("D10", 5),
    ("D11", 23),
    ("D12", 19),
    ("D13", 18),
    ("D14", 21),
    ("D15", 22),
    ("A0", 2),
    ("A1", 4),
    ("A2", 35),
    ("A3", 34),
    ("A4", 36),
    ("A5", 39),
];

impl PinId {
    /// GPIOs that exist on the ESP32: 0-19, 21-23, 25-27 and 32-39.
    pub const fn is_valid(&self) -> bool {
        matches!(self.0, 0..=19 | 21..=23 | 25..=27 | 32..=39)
    }

    pub fn from_arduino(name: &str) -> Option<Self> {
        ARDUINO_PINS
            .iter()
            .find(|(arduino, _)| arduino.eq_ignore_ascii_case(name))
            .map(|&(_, gpio)| Self(gpio))
    }

    /// Accepts a plain GPIO number or an Arduino header name.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text
            .strip_prefix("GPIO")
            .or_else(|| text.strip_prefix("gpio"))
            .unwrap_or(text);
        match text.parse::<u8>() {
            Ok(number) => Some(Self(number)),
            Err(_) => Self::from_arduino(text),
        }
    }

    pub const fn mask(&self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO[{}]", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinMode {
    #[default]
    Disabled,
    Input,
    Output,
    OutputOpenDrain,
    InputOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptType {
    #[default]
    Disable,
    PosEdge,
    NegEdge,
    AnyEdge,
    LowLevel,
    HighLevel,
}

impl InterruptType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "INTR_DISABLE",
            Self::PosEdge => "INTR_POSEDGE",
            Self::NegEdge => "INTR_NEGEDGE",
            Self::AnyEdge => "INTR_ANYEDGE",
            Self::LowLevel => "INTR_LOW_LEVEL",
            Self::HighLevel => "INTR_HIGH_LEVEL",
        }
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pin configuration. The default value is the all-zero "unset" config,
/// which the registry refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinConfig {
    pub mode: PinMode,
    pub pull_up: bool,
    pub pull_down: bool,
    pub interrupt: InterruptType,
}

impl PinConfig {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioError {
    AlreadyClaimed(PinId),
    EmptyConfig(PinId),
    InvalidPin(PinId),
    NotClaimed(PinId),
    Driver(PinId, DriverError),
}

impl fmt::Display for GpioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyClaimed(pin) => write!(f, "{} is already claimed", pin),
            Self::EmptyConfig(pin) => write!(f, "{} was given an empty configuration", pin),
            Self::InvalidPin(pin) => write!(f, "{} is not a valid GPIO", pin),
            Self::NotClaimed(pin) => write!(f, "{} is not claimed", pin),
            Self::Driver(pin, e) => write!(f, "GPIO driver rejected {}: {}", pin, e),
        }
    }
}

impl std::error::Error for GpioError {}

/// Runs in interrupt context: must not block, allocate or log.
pub type IsrHandler = Box<dyn Fn() + Send + Sync>;

/// The raw pin driver.
#[cfg_attr(test, mockall::automock)]
pub trait GpioDriver: Send + Sync {
    fn configure(&self, pin: PinId, config: &PinConfig) -> Result<(), DriverError>;
    /// `INVALID_STATE` means the service is already installed.
    fn install_isr_service(&self) -> Result<(), DriverError>;
    fn add_isr_handler(&self, pin: PinId, handler: IsrHandler) -> Result<(), DriverError>;
    /// Arm the pin's interrupt. Drivers may disarm it each time it fires.
    fn enable_interrupt(&self, pin: PinId) -> Result<(), DriverError>;
    fn remove_isr_handler(&self, pin: PinId) -> Result<(), DriverError>;
    fn reset_pin(&self, pin: PinId) -> Result<(), DriverError>;
    fn level(&self, pin: PinId) -> bool;
}

#[derive(Default)]
struct Claims {
    configs: HashMap<PinId, PinConfig>,
    pins: HashSet<PinId>,
    with_isr: HashSet<PinId>,
    isr_service_installed: bool,
}

/// Book-keeping of claimed pins. One mutex serializes every operation.
pub struct PinRegistry {
    driver: Arc<dyn GpioDriver>,
    claims: Mutex<Claims>,
}

impl PinRegistry {
    pub fn new(driver: Arc<dyn GpioDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            claims: Mutex::new(Claims::default()),
        })
    }

    pub fn driver(&self) -> &Arc<dyn GpioDriver> {
        &self.driver
    }

    pub fn claim(
        &self,
        pin: PinId,
        config: PinConfig,
        isr: Option<IsrHandler>,
    ) -> Result<(), GpioError> {
        if !pin.is_valid() {
            return Err(GpioError::InvalidPin(pin));
        }
        if config.is_empty() {
            return Err(GpioError::EmptyConfig(pin));
        }

        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if claims.pins.contains(&pin) {
            return Err(GpioError::AlreadyClaimed(pin));
        }

        self.driver
            .configure(pin, &config)
            .map_err(|e| GpioError::Driver(pin, e))?;

        let has_isr = isr.is_some();
        if let Some(isr) = isr {
            if let Err(e) = self.attach_isr(&mut claims, pin, isr) {
                if let Err(reset) = self.driver.reset_pin(pin) {
                    warn!("Failed to reset {} after ISR setup failed: {}", pin, reset);
                }
                return Err(GpioError::Driver(pin, e));
            }
        }

        claims.pins.insert(pin);
        claims.configs.insert(pin, config);
        if has_isr {
            claims.with_isr.insert(pin);
        }

        info!("Registered {}", pin);
        Ok(())
    }

    fn attach_isr(&self, claims: &mut Claims, pin: PinId, isr: IsrHandler) -> Result<(), DriverError> {
        if !claims.isr_service_installed {
            tolerate_invalid_state(self.driver.install_isr_service())?;
            claims.isr_service_installed = true;
        }
        self.driver.add_isr_handler(pin, isr)?;

        if let Err(e) = self.driver.enable_interrupt(pin) {
            if let Err(remove) = self.driver.remove_isr_handler(pin) {
                warn!("Failed to remove ISR handler of {}: {}", pin, remove);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Re-arm the interrupt of a pin claimed with an ISR, after it fired.
    pub fn rearm(&self, pin: PinId) -> Result<(), GpioError> {
        let claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if !claims.with_isr.contains(&pin) {
            return Err(GpioError::NotClaimed(pin));
        }
        self.driver
            .enable_interrupt(pin)
            .map_err(|e| GpioError::Driver(pin, e))
    }

    pub fn release(&self, pin: PinId) -> Result<(), GpioError> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if !claims.pins.contains(&pin) {
            return Err(GpioError::NotClaimed(pin));
        }

        if claims.with_isr.remove(&pin) {
            if let Err(e) = self.driver.remove_isr_handler(pin) {
                warn!("Failed to remove ISR handler of {}: {}", pin, e);
            }
        }
        if let Err(e) = self.driver.reset_pin(pin) {
            warn!("Failed to reset {}: {}", pin, e);
        }

        claims.pins.remove(&pin);
        claims.configs.remove(&pin);

        info!("Unregistered {}", pin);
        Ok(())
    }

    pub fn is_claimed(&self, pin: PinId) -> bool {
        let claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let claimed = claims.pins.contains(&pin);
        debug_assert_eq!(claimed, claims.configs.contains_key(&pin));
        claimed
    }

    pub fn lookup_config(&self, pin: PinId) -> Option<PinConfig> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .configs
            .get(&pin)
            .copied()
    }
}

/// What an ISR forwards to the consuming task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsrEvent {
    pub pin: PinId,
    pub edge: InterruptType,
}

pub type IsrQueue = HandoffQueue<IsrEvent>;

/// The argument block handed to an ISR function.
pub struct IsrArgs {
    pub pin: PinId,
    pub config: PinConfig,
    /// Weak so that an ISR firing during teardown finds nothing to push to.
    pub queue: Weak<IsrQueue>,
    pub user: Option<Arc<dyn Any + Send + Sync>>,
}

pub type IsrFn = fn(&IsrArgs);

/// A claimed pin, released when dropped.
pub struct Gpio {
    registry: Arc<PinRegistry>,
    pin: PinId,
    queue: Option<Arc<IsrQueue>>,
}

impl Gpio {
    /// Claim `pin` without an interrupt handler.
    pub fn new(registry: &Arc<PinRegistry>, pin: PinId, config: PinConfig) -> Result<Self, GpioError> {
        registry.claim(pin, config, None)?;
        Ok(Self {
            registry: registry.clone(),
            pin,
            queue: None,
        })
    }

    /// Claim `pin` and route its interrupts through `isr`, which receives an
    /// argument block pointing at this guard's queue.
    pub fn with_isr(
        registry: &Arc<PinRegistry>,
        pin: PinId,
        config: PinConfig,
        isr: IsrFn,
        user: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Self, GpioError> {
        let queue = IsrQueue::new_shared().ok_or(GpioError::Driver(pin, DriverError::NO_MEM))?;
        let args = IsrArgs {
            pin,
            config,
            queue: Arc::downgrade(&queue),
            user,
        };

        // The closure owns the argument block, so it lives until the handler is removed.
        registry.claim(pin, config, Some(Box::new(move || isr(&args))))?;
        debug!("{} interrupt routed ({})", pin, config.interrupt);

        Ok(Self {
            registry: registry.clone(),
            pin,
            queue: Some(queue),
        })
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn queue(&self) -> Option<&Arc<IsrQueue>> {
        self.queue.as_ref()
    }

    pub fn level(&self) -> bool {
        self.registry.driver().level(self.pin)
    }

    pub fn rearm(&self) -> Result<(), GpioError> {
        self.registry.rearm(self.pin)
    }
}

impl Drop for Gpio {
    fn drop(&mut self) {
        if let Err(e) = self.registry.release(self.pin) {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::sync::Mutex as StdMutex;

    fn button() -> PinConfig {
        PinConfig {
            mode: PinMode::Input,
            pull_up: false,
            pull_down: true,
            interrupt: InterruptType::NegEdge,
        }
    }

    fn permissive_driver() -> MockGpioDriver {
        let mut driver = MockGpioDriver::new();
        driver.expect_configure().returning(|_, _| Ok(()));
        driver.expect_install_isr_service().returning(|| Ok(()));
        driver.expect_add_isr_handler().returning(|_, _| Ok(()));
        driver.expect_enable_interrupt().returning(|_| Ok(()));
        driver.expect_remove_isr_handler().returning(|_| Ok(()));
        driver.expect_reset_pin().returning(|_| Ok(()));
        driver.expect_level().returning(|_| false);
        driver
    }

    #[test]
    fn claim_release_and_lookup() {
        let registry = PinRegistry::new(Arc::new(permissive_driver()));
        let pin = PinId(34);

        registry.claim(pin, button(), None).unwrap();
        assert!(registry.is_claimed(pin));
        assert_eq!(registry.lookup_config(pin), Some(button()));

        registry.release(pin).unwrap();
        assert!(!registry.is_claimed(pin));
        assert_eq!(registry.lookup_config(pin), None);
    }

    #[test]
    fn double_claim_is_rejected() {
        let registry = PinRegistry::new(Arc::new(permissive_driver()));
        registry.claim(PinId(4), button(), None).unwrap();
        assert_eq!(
            registry.claim(PinId(4), button(), None),
            Err(GpioError::AlreadyClaimed(PinId(4)))
        );
    }

    #[test]
    fn contract_violations() {
        let registry = PinRegistry::new(Arc::new(MockGpioDriver::new()));
        assert_eq!(
            registry.claim(PinId(20), button(), None),
            Err(GpioError::InvalidPin(PinId(20)))
        );
        assert_eq!(
            registry.claim(PinId(4), PinConfig::default(), None),
            Err(GpioError::EmptyConfig(PinId(4)))
        );
        assert_eq!(registry.release(PinId(4)), Err(GpioError::NotClaimed(PinId(4))));
    }

    #[test]
    fn already_installed_isr_service_is_success() {
        let mut driver = MockGpioDriver::new();
        driver.expect_configure().returning(|_, _| Ok(()));
        driver
            .expect_install_isr_service()
            .times(1)
            .returning(|| Err(DriverError::INVALID_STATE));
        driver
            .expect_add_isr_handler()
            .with(eq(PinId(34)), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(()));
        driver
            .expect_enable_interrupt()
            .with(eq(PinId(34)))
            .times(1)
            .returning(|_| Ok(()));
        driver
            .expect_remove_isr_handler()
            .with(eq(PinId(34)))
            .times(1)
            .returning(|_| Ok(()));
        driver.expect_reset_pin().times(1).returning(|_| Ok(()));

        let registry = PinRegistry::new(Arc::new(driver));
        registry.claim(PinId(34), button(), Some(Box::new(|| {}))).unwrap();
        registry.release(PinId(34)).unwrap();
    }

    #[test]
    fn failed_handler_add_leaves_pin_unclaimed() {
        let mut driver = MockGpioDriver::new();
        driver.expect_configure().returning(|_, _| Ok(()));
        driver.expect_install_isr_service().returning(|| Ok(()));
        driver
            .expect_add_isr_handler()
            .returning(|_, _| Err(DriverError::NO_MEM));
        driver.expect_reset_pin().times(1).returning(|_| Ok(()));

        let registry = PinRegistry::new(Arc::new(driver));
        assert_eq!(
            registry.claim(PinId(5), button(), Some(Box::new(|| {}))),
            Err(GpioError::Driver(PinId(5), DriverError::NO_MEM))
        );
        assert!(!registry.is_claimed(PinId(5)));
    }

    #[test]
    fn failed_interrupt_enable_removes_handler() {
        let mut driver = MockGpioDriver::new();
        driver.expect_configure().returning(|_, _| Ok(()));
        driver.expect_install_isr_service().returning(|| Ok(()));
        driver.expect_add_isr_handler().times(1).returning(|_, _| Ok(()));
        driver
            .expect_enable_interrupt()
            .returning(|_| Err(DriverError::INVALID_STATE));
        driver.expect_remove_isr_handler().times(1).returning(|_| Ok(()));
        driver.expect_reset_pin().times(1).returning(|_| Ok(()));

        let registry = PinRegistry::new(Arc::new(driver));
        assert_eq!(
            registry.claim(PinId(5), button(), Some(Box::new(|| {}))),
            Err(GpioError::Driver(PinId(5), DriverError::INVALID_STATE))
        );
        assert!(!registry.is_claimed(PinId(5)));
    }

    #[test]
    fn rearm_needs_an_isr_claim() {
        let registry = PinRegistry::new(Arc::new(permissive_driver()));
        registry.claim(PinId(4), button(), None).unwrap();
        assert_eq!(registry.rearm(PinId(4)), Err(GpioError::NotClaimed(PinId(4))));

        registry.claim(PinId(34), button(), Some(Box::new(|| {}))).unwrap();
        assert_eq!(registry.rearm(PinId(34)), Ok(()));
    }

    fn forward(args: &IsrArgs) {
        if let Some(queue) = args.queue.upgrade() {
            let _ = queue.push_from_isr(IsrEvent {
                pin: args.pin,
                edge: args.config.interrupt,
            });
        }
    }

    #[test]
    fn guard_routes_interrupts_and_releases_on_drop() {
        let installed: Arc<StdMutex<Option<IsrHandler>>> = Arc::new(StdMutex::new(None));

        let mut driver = MockGpioDriver::new();
        driver.expect_configure().returning(|_, _| Ok(()));
        driver.expect_install_isr_service().returning(|| Ok(()));
        {
            let installed = installed.clone();
            driver.expect_add_isr_handler().returning(move |_, handler| {
                *installed.lock().unwrap() = Some(handler);
                Ok(())
            });
        }
        driver.expect_enable_interrupt().returning(|_| Ok(()));
        {
            let installed = installed.clone();
            driver.expect_remove_isr_handler().returning(move |_| {
                installed.lock().unwrap().take();
                Ok(())
            });
        }
        driver.expect_reset_pin().returning(|_| Ok(()));

        let registry = PinRegistry::new(Arc::new(driver));
        let gpio = Gpio::with_isr(&registry, PinId(34), button(), forward, None).unwrap();
        let queue = gpio.queue().unwrap().clone();

        (installed.lock().unwrap().as_ref().unwrap())();
        assert_eq!(
            queue.pop(),
            Some(IsrEvent {
                pin: PinId(34),
                edge: InterruptType::NegEdge
            })
        );

        drop(gpio);
        assert!(!registry.is_claimed(PinId(34)));
        assert!(installed.lock().unwrap().is_none());
    }

    #[test]
    fn arduino_names_and_numbers_parse() {
        assert_eq!(PinId::from_arduino("A3"), Some(PinId(34)));
        assert_eq!(PinId::from_arduino("d10"), Some(PinId(5)));
        assert_eq!(PinId::from_arduino("D1"), None);
        assert_eq!(PinId::parse("GPIO26"), Some(PinId(26)));
        assert_eq!(PinId::parse("17"), Some(PinId(17)));
        assert_eq!(PinId::parse("A5"), Some(PinId(39)));
    }

    #[test]
    fn interrupt_names() {
        assert_eq!(InterruptType::NegEdge.as_str(), "INTR_NEGEDGE");
        assert_eq!(InterruptType::default().to_string(), "INTR_DISABLE");
    }
}
