use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::error::DriverError;
use crate::event::{ip_event, wifi_event, EventBase, EventData};
use crate::handle::{Netif, NetifId};
use crate::wifi::{ClientConfig, WifiDriver};

use super::events::SimEventLoop;

// WIFI_REASON_ASSOC_LEAVE
const REASON_ASSOC_LEAVE: u8 = 8;

/// Driver calls as recorded by [`SimWifiDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WifiCall {
    NetifInit,
    CreateStaNetif,
    DestroyNetif,
    Init,
    SetModeSta,
    Start,
    Stop,
    Deinit,
    SetConfig,
    Connect,
    Disconnect,
    ClearDefaultHandlers,
}

#[derive(Default)]
struct Radio {
    initialised: bool,
    station: bool,
    started: bool,
    connected: bool,
    config: ClientConfig,
    next_netif: usize,
    access_points: Vec<(String, String)>,
    rejections: HashMap<WifiCall, DriverError>,
}

/// Station driver that "connects" to whichever access points were added.
///
/// Connecting to an unknown network posts nothing, so the manager waits
/// instead of retrying in a loop.
pub struct SimWifiDriver {
    events: Arc<SimEventLoop>,
    radio: Mutex<Radio>,
    calls: Arc<Mutex<Vec<WifiCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimWifiDriver {
    pub fn new(events: Arc<SimEventLoop>) -> Arc<Self> {
        Arc::new(Self {
            events,
            radio: Mutex::new(Radio::default()),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn add_access_point(&self, ssid: &str, password: &str) {
        lock(&self.radio)
            .access_points
            .push((ssid.to_string(), password.to_string()));
    }

    /// Fail the next `call` with `error`.
    pub fn reject_next(&self, call: WifiCall, error: DriverError) {
        lock(&self.radio).rejections.insert(call, error);
    }

    pub fn calls(&self) -> Vec<WifiCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, call: WifiCall) -> usize {
        lock(&self.calls).iter().filter(|c| **c == call).count()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.radio).connected
    }

    // Records the call and returns the radio, or the queued rejection.
    fn begin(&self, call: WifiCall) -> Result<MutexGuard<'_, Radio>, DriverError> {
        lock(&self.calls).push(call);
        let mut radio = lock(&self.radio);
        match radio.rejections.remove(&call) {
            Some(e) => Err(e),
            None => Ok(radio),
        }
    }
}

impl WifiDriver for SimWifiDriver {
    fn netif_init(&self) -> Result<(), DriverError> {
        self.begin(WifiCall::NetifInit)?;
        Ok(())
    }

    fn create_default_sta_netif(&self) -> Result<Netif, DriverError> {
        let mut radio = self.begin(WifiCall::CreateStaNetif)?;
        radio.next_netif += 1;
        let id = NetifId(radio.next_netif);

        let calls = self.calls.clone();
        Ok(Netif::new(id, move |id| {
            debug!("Destroying netif {:?}", id);
            lock(&calls).push(WifiCall::DestroyNetif);
        }))
    }

    fn init(&self) -> Result<(), DriverError> {
        self.begin(WifiCall::Init)?.initialised = true;
        Ok(())
    }

    fn set_mode_sta(&self) -> Result<(), DriverError> {
        let mut radio = self.begin(WifiCall::SetModeSta)?;
        if !radio.initialised {
            return Err(DriverError::WIFI_NOT_INIT);
        }
        radio.station = true;
        Ok(())
    }

    fn start(&self) -> Result<(), DriverError> {
        {
            let mut radio = self.begin(WifiCall::Start)?;
            if !radio.initialised || !radio.station {
                return Err(DriverError::WIFI_NOT_INIT);
            }
            radio.started = true;
        }
        self.events
            .post(EventBase::Wifi, wifi_event::STA_START, EventData::None);
        Ok(())
    }

    fn stop(&self) -> Result<(), DriverError> {
        {
            let mut radio = self.begin(WifiCall::Stop)?;
            if !radio.initialised {
                return Err(DriverError::WIFI_NOT_INIT);
            }
            if !radio.started {
                return Ok(());
            }
            radio.started = false;
            radio.connected = false;
        }
        self.events
            .post(EventBase::Wifi, wifi_event::STA_STOP, EventData::None);
        Ok(())
    }

    fn deinit(&self) -> Result<(), DriverError> {
        let mut radio = self.begin(WifiCall::Deinit)?;
        if !radio.initialised {
            return Err(DriverError::WIFI_NOT_INIT);
        }
        if radio.started {
            return Err(DriverError::WIFI_NOT_STOPPED);
        }
        radio.initialised = false;
        radio.station = false;
        Ok(())
    }

    fn set_config(&self, config: &ClientConfig) -> Result<(), DriverError> {
        let mut radio = self.begin(WifiCall::SetConfig)?;
        if !radio.initialised {
            return Err(DriverError::WIFI_NOT_INIT);
        }
        radio.config = *config;
        Ok(())
    }

    fn get_config(&self) -> Result<ClientConfig, DriverError> {
        let radio = lock(&self.radio);
        if !radio.initialised {
            return Err(DriverError::WIFI_NOT_INIT);
        }
        Ok(radio.config)
    }

    fn connect(&self) -> Result<(), DriverError> {
        let reachable = {
            let mut radio = self.begin(WifiCall::Connect)?;
            if !radio.started {
                return Err(DriverError::WIFI_NOT_STARTED);
            }
            let ssid = radio.config.ssid_str();
            let password = radio.config.password_str();
            let reachable = radio
                .access_points
                .iter()
                .any(|(s, p)| *s == ssid && *p == password);
            radio.connected = reachable;
            reachable
        };

        if reachable {
            self.events
                .post(EventBase::Wifi, wifi_event::STA_CONNECTED, EventData::None);
            self.events.post(
                EventBase::Ip,
                ip_event::STA_GOT_IP,
                EventData::GotIp {
                    ip: Ipv4Addr::new(192, 168, 1, 100),
                },
            );
        } else {
            info!("No access point answers to this config");
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), DriverError> {
        {
            let mut radio = self.begin(WifiCall::Disconnect)?;
            if !radio.started {
                return Err(DriverError::WIFI_NOT_STARTED);
            }
            if !radio.connected {
                return Ok(());
            }
            radio.connected = false;
        }
        self.events.post(
            EventBase::Wifi,
            wifi_event::STA_DISCONNECTED,
            EventData::Disconnected {
                reason: REASON_ASSOC_LEAVE,
            },
        );
        Ok(())
    }

    fn clear_default_handlers(&self, _netif: NetifId) -> Result<(), DriverError> {
        self.begin(WifiCall::ClearDefaultHandlers)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> (Arc<SimEventLoop>, Arc<SimWifiDriver>) {
        let events = SimEventLoop::new();
        let driver = SimWifiDriver::new(events.clone());
        driver.init().unwrap();
        driver.set_mode_sta().unwrap();
        driver.start().unwrap();
        (events, driver)
    }

    #[test]
    fn connects_only_to_known_access_points() {
        let (_events, driver) = started();
        driver.add_access_point("home", "hunter22");

        driver.set_config(&ClientConfig::new("home", "wrong")).unwrap();
        driver.connect().unwrap();
        assert!(!driver.is_connected());

        driver.set_config(&ClientConfig::new("home", "hunter22")).unwrap();
        driver.connect().unwrap();
        assert!(driver.is_connected());
    }

    #[test]
    fn rejection_applies_once() {
        let (_events, driver) = started();
        driver.reject_next(WifiCall::Connect, DriverError::WIFI_CONN);
        assert_eq!(driver.connect(), Err(DriverError::WIFI_CONN));
        assert_eq!(driver.connect(), Ok(()));
        assert_eq!(driver.count(WifiCall::Connect), 2);
    }

    #[test]
    fn deinit_requires_stop() {
        let (_events, driver) = started();
        assert_eq!(driver.deinit(), Err(DriverError::WIFI_NOT_STOPPED));
        driver.stop().unwrap();
        assert_eq!(driver.deinit(), Ok(()));
        assert_eq!(driver.get_config(), Err(DriverError::WIFI_NOT_INIT));
    }
}
