//! Button-driven provisioning driver.
//!
//! Each press of the trigger button starts (or re-joins) a provisioning
//! session and keeps a reference to it. Once [`AppConfig::max_held_sessions`]
//! references are held, the next press wipes the stored credentials,
//! disconnects, and lets every held session go.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use crate::config::AppConfig;
use crate::gpio::{Gpio, IsrArgs, IsrEvent, IsrQueue, PinRegistry};
use crate::runtime::Runtime;
use crate::smartconfig::ProvisioningSession;
use crate::sync::Timeout;
use crate::wifi::NetworkManager;

/// Trigger-pin ISR: forwards the edge to the application task.
pub fn gpio_isr_handler(args: &IsrArgs) {
    if let Some(queue) = args.queue.upgrade() {
        // A full queue drops the press; the queue counts it.
        let _ = queue.push_from_isr(IsrEvent {
            pin: args.pin,
            edge: args.config.interrupt,
        });
    }
}

/// Outcome of one [`App::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing arrived before the timeout.
    Waiting,
    /// A session is held; the number of sessions now held.
    Held(usize),
    /// Stored credentials were wiped and the held sessions released.
    Wiped,
}

pub struct App {
    rt: Arc<Runtime>,
    config: AppConfig,
    queue: Arc<IsrQueue>,
    sessions: Vec<Arc<ProvisioningSession>>,
    _wifi: Option<Arc<NetworkManager>>,
    trigger: Gpio,
}

impl App {
    pub fn new(rt: Arc<Runtime>, registry: &Arc<PinRegistry>, config: AppConfig) -> Result<Self> {
        info!("🔘 GPIO main started");

        // Claim the trigger button and route its interrupt into our queue
        let trigger = Gpio::with_isr(
            registry,
            config.trigger_pin,
            config.trigger_config(),
            gpio_isr_handler,
            None,
        )
        .context("Failed to claim the provisioning trigger")?;
        let queue = trigger
            .queue()
            .cloned()
            .ok_or_else(|| anyhow!("{} has no ISR queue", trigger.pin()))?;

        if config.wifi.clear_credentials_on_construction {
            error!("CLEAR_WIFI_NVS is enabled");
        }

        // Hold WiFi from boot so stored credentials reconnect without a press
        let wifi = if config.keep_wifi_alive {
            warn!("KEEP_WIFI_ALIVE is enabled");
            Some(NetworkManager::get_shared_with(&rt, config.wifi)?)
        } else {
            None
        };

        Ok(Self {
            rt,
            config,
            queue,
            sessions: Vec::new(),
            _wifi: wifi,
            trigger,
        })
    }

    /// Handle at most one trigger event, waiting up to `timeout` for it.
    pub fn poll(&mut self, timeout: Timeout) -> Result<Dispatch> {
        let Some(event) = self.queue.pop_wait(timeout) else {
            info!("Waiting for interrupt");
            return Ok(Dispatch::Waiting);
        };

        info!(
            "🔘 {} intr, val: {}, state: {}",
            event.pin,
            u8::from(self.trigger.level()),
            event.edge
        );

        // The driver may have disarmed the interrupt when it fired
        if let Err(e) = self.trigger.rearm() {
            warn!("Failed to re-arm the trigger: {}", e);
        }

        // One press too many: forget the network and let every session go
        if self.sessions.len() >= self.config.max_held_sessions {
            warn!("🧹 Clearing instances and wiping WiFi NVS");
            if let Some(session) = self.sessions.first() {
                let wifi = session.wifi().clone();
                wifi.erase_credentials();
                wifi.disconnect();
            }
            self.sessions.clear();
            return Ok(Dispatch::Wiped);
        }

        // Every press holds one more reference to the same live session
        info!("Pushing back instance");
        self.sessions.push(ProvisioningSession::get_shared(&self.rt)?);
        Ok(Dispatch::Held(self.sessions.len()))
    }

    pub fn run(mut self) -> Result<()> {
        loop {
            self.poll(Timeout::FOREVER)?;
        }
    }

    pub fn held_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn dropped_events(&self) -> u32 {
        self.queue.dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::PinId;
    use crate::sim::SimServices;

    fn app(sim: &SimServices, keep_wifi_alive: bool) -> App {
        let config = AppConfig {
            keep_wifi_alive,
            ..AppConfig::default()
        };
        App::new(sim.runtime(), &sim.registry(), config).unwrap()
    }

    #[test]
    fn timeout_reports_waiting() {
        let sim = SimServices::new();
        let mut app = app(&sim, false);
        assert_eq!(app.poll(Timeout::from_millis(10)).unwrap(), Dispatch::Waiting);
    }

    #[test]
    fn presses_accumulate_then_sixth_wipes() {
        let sim = SimServices::new();
        sim.storage.seed("wifi", "ssid", "home");
        sim.storage.seed("wifi", "password", "hunter22");
        let mut app = app(&sim, false);

        for held in 1..=5 {
            sim.gpio.trigger(PinId(34));
            assert_eq!(app.poll(Timeout::from_millis(1000)).unwrap(), Dispatch::Held(held));
        }
        assert_eq!(app.held_sessions(), 5);

        sim.gpio.trigger(PinId(34));
        assert_eq!(app.poll(Timeout::from_millis(1000)).unwrap(), Dispatch::Wiped);
        assert_eq!(app.held_sessions(), 0);
        assert_eq!(sim.storage.value("wifi", "ssid"), None);
        assert_eq!(sim.storage.value("wifi", "password"), None);
    }

    #[test]
    fn keep_alive_holds_wifi_from_boot() {
        let sim = SimServices::new();
        let app = app(&sim, true);
        assert!(NetworkManager::get_weak(&app.rt).upgrade().is_some());
    }

    #[test]
    fn each_press_rearms_the_trigger() {
        let sim = SimServices::new();
        let mut app = app(&sim, false);
        assert_eq!(sim.gpio.interrupt_enables(PinId(34)), 1);

        sim.gpio.trigger(PinId(34));
        app.poll(Timeout::from_millis(1000)).unwrap();
        sim.gpio.trigger(PinId(34));
        app.poll(Timeout::from_millis(1000)).unwrap();
        assert_eq!(sim.gpio.interrupt_enables(PinId(34)), 3);
    }

    #[test]
    fn trigger_pin_is_released_with_the_app() {
        let sim = SimServices::new();
        let registry = sim.registry();
        let app = App::new(sim.runtime(), &registry, AppConfig::default()).unwrap();
        assert!(registry.is_claimed(PinId(34)));
        drop(app);
        assert!(!registry.is_claimed(PinId(34)));
    }
}
