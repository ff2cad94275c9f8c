//! Build-time application configuration.
//!
//! The provisioning trigger can be moved at build time:
//!
//! ```text
//! PROVISION_TRIGGER_PIN=A3 PROVISION_TRIGGER_PULL=down PROVISION_TRIGGER_EDGE=falling cargo build
//! ```

use anyhow::{anyhow, Result};

use crate::gpio::{InterruptType, PinConfig, PinId, PinMode};
use crate::task::TaskConfig;
use crate::wifi::WifiOptions;

pub const DEFAULT_TRIGGER_PIN: PinId = PinId(34);
pub const DEFAULT_TRIGGER_PULL: TriggerPull = TriggerPull::Down;
pub const DEFAULT_TRIGGER_EDGE: InterruptType = InterruptType::NegEdge;

/// Sessions held before the next press wipes the stored credentials instead.
pub const MAX_HELD_SESSIONS: usize = 5;

pub const APP_TASK: TaskConfig = TaskConfig::new(c"gpio_main", 4096, 10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPull {
    Up,
    Down,
    Floating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppConfig {
    pub trigger_pin: PinId,
    pub trigger_pull: TriggerPull,
    pub trigger_edge: InterruptType,
    pub max_held_sessions: usize,
    /// Hold a WiFi reference from boot so stored credentials reconnect without a press.
    pub keep_wifi_alive: bool,
    pub wifi: WifiOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            trigger_pin: DEFAULT_TRIGGER_PIN,
            trigger_pull: DEFAULT_TRIGGER_PULL,
            trigger_edge: DEFAULT_TRIGGER_EDGE,
            max_held_sessions: MAX_HELD_SESSIONS,
            keep_wifi_alive: cfg!(feature = "keep-wifi-alive"),
            wifi: WifiOptions::default(),
        }
    }
}

impl AppConfig {
    pub fn from_build_env() -> Result<Self> {
        Self::from_overrides(
            option_env!("PROVISION_TRIGGER_PIN"),
            option_env!("PROVISION_TRIGGER_PULL"),
            option_env!("PROVISION_TRIGGER_EDGE"),
        )
    }

    pub fn from_overrides(pin: Option<&str>, pull: Option<&str>, edge: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(pin) = pin {
            config.trigger_pin =
                PinId::parse(pin).ok_or_else(|| anyhow!("Unknown trigger pin '{}'", pin))?;
        }
        if !config.trigger_pin.is_valid() {
            return Err(anyhow!("{} is not a valid trigger pin", config.trigger_pin));
        }

        if let Some(pull) = pull {
            config.trigger_pull = match pull.trim().to_ascii_lowercase().as_str() {
                "up" => TriggerPull::Up,
                "down" => TriggerPull::Down,
                "none" | "floating" => TriggerPull::Floating,
                other => return Err(anyhow!("Unknown trigger pull '{}'", other)),
            };
        }

        if let Some(edge) = edge {
            config.trigger_edge = match edge.trim().to_ascii_lowercase().as_str() {
                "falling" | "negedge" => InterruptType::NegEdge,
                "rising" | "posedge" => InterruptType::PosEdge,
                "any" | "anyedge" => InterruptType::AnyEdge,
                other => return Err(anyhow!("Unknown trigger edge '{}'", other)),
            };
        }

        Ok(config)
    }

    pub fn trigger_config(&self) -> PinConfig {
        PinConfig {
            mode: PinMode::Input,
            pull_up: self.trigger_pull == TriggerPull::Up,
            pull_down: self.trigger_pull == TriggerPull::Down,
            interrupt: self.trigger_edge,
        }
    }
}
