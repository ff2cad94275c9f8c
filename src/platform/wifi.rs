use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::netif::{EspNetif, NetifStack};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::EspError;
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};
use log::{debug, info};

use crate::error::DriverError;
use crate::handle::{Netif, NetifId};
use crate::wifi::{ClientConfig, WifiDriver};

#[derive(Default)]
struct Station {
    // Created ahead of the driver, swapped in by `init`
    netif: Option<EspNetif>,
    wifi: Option<EspWifi<'static>>,
}

/// Station mode on esp-idf-svc's [`EspWifi`].
///
/// `init` constructs the `EspWifi` and `deinit` drops it again, so every
/// network manager gets a freshly initialised radio.
pub struct EspWifiDriver {
    modem: Mutex<Modem>,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    station: Arc<Mutex<Station>>,
    next_netif: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EspWifiDriver {
    pub fn new(modem: Modem, sys_loop: EspSystemEventLoop, nvs: EspDefaultNvsPartition) -> Self {
        Self {
            modem: Mutex::new(modem),
            sys_loop,
            nvs,
            station: Arc::new(Mutex::new(Station::default())),
            next_netif: AtomicUsize::new(0),
        }
    }

    fn with_wifi<R>(
        &self,
        f: impl FnOnce(&mut EspWifi<'static>) -> Result<R, EspError>,
    ) -> Result<R, DriverError> {
        let mut station = lock(&self.station);
        let wifi = station.wifi.as_mut().ok_or(DriverError::WIFI_NOT_INIT)?;
        Ok(f(wifi)?)
    }
}

fn client_configuration(config: &ClientConfig) -> Result<ClientConfiguration, DriverError> {
    let ssid = config
        .ssid_text()
        .and_then(|ssid| ssid.try_into().ok())
        .ok_or(DriverError::WIFI_SSID)?;
    let password = config
        .password_text()
        .and_then(|password| password.try_into().ok())
        .ok_or(DriverError::WIFI_PASSWORD)?;

    Ok(ClientConfiguration {
        ssid,
        password,
        bssid: config.bssid,
        auth_method: if config.password_bytes().is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        ..Default::default()
    })
}

impl WifiDriver for EspWifiDriver {
    // EspNetif brings the TCP/IP stack up on first use.
    fn netif_init(&self) -> Result<(), DriverError> {
        Ok(())
    }

    fn create_default_sta_netif(&self) -> Result<Netif, DriverError> {
        let netif = EspNetif::new(NetifStack::Sta)?;
        lock(&self.station).netif = Some(netif);

        let id = NetifId(self.next_netif.fetch_add(1, Ordering::Relaxed) + 1);
        let station = self.station.clone();
        Ok(Netif::new(id, move |id| {
            debug!("Releasing netif {:?}", id);
            // Only still here if `init` never ran; otherwise it went down with the EspWifi.
            lock(&station).netif.take();
        }))
    }

    fn init(&self) -> Result<(), DriverError> {
        let mut station = lock(&self.station);
        if station.wifi.is_some() {
            return Err(DriverError::INVALID_STATE);
        }

        // At most one EspWifi exists at a time, so the modem is never driven twice.
        let modem = unsafe { lock(&self.modem).clone_unchecked() };
        let mut wifi = EspWifi::new(modem, self.sys_loop.clone(), Some(self.nvs.clone()))?;

        // Replace the netif EspWifi made for itself with ours
        if let Some(netif) = station.netif.take() {
            drop(wifi.swap_netif_sta(netif)?);
        }

        station.wifi = Some(wifi);
        info!("📶 WiFi driver initialised");
        Ok(())
    }

    fn set_mode_sta(&self) -> Result<(), DriverError> {
        // A client configuration puts the driver in station mode
        self.with_wifi(|wifi| {
            wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))
        })
    }

    fn start(&self) -> Result<(), DriverError> {
        self.with_wifi(|wifi| wifi.start())
    }

    fn stop(&self) -> Result<(), DriverError> {
        self.with_wifi(|wifi| wifi.stop())
    }

    fn deinit(&self) -> Result<(), DriverError> {
        let wifi = lock(&self.station)
            .wifi
            .take()
            .ok_or(DriverError::WIFI_NOT_INIT)?;

        // Dropped outside the lock; the driver posts events while going down.
        drop(wifi);
        info!("📴 WiFi driver released");
        Ok(())
    }

    fn set_config(&self, config: &ClientConfig) -> Result<(), DriverError> {
        let client = client_configuration(config)?;
        self.with_wifi(|wifi| wifi.set_configuration(&Configuration::Client(client)))
    }

    fn get_config(&self) -> Result<ClientConfig, DriverError> {
        let configuration = self.with_wifi(|wifi| wifi.get_configuration())?;
        match configuration {
            Configuration::Client(client) | Configuration::Mixed(client, _) => {
                let mut config = ClientConfig::new(client.ssid.as_str(), client.password.as_str());
                config.bssid = client.bssid;
                Ok(config)
            }
            _ => Ok(ClientConfig::default()),
        }
    }

    fn connect(&self) -> Result<(), DriverError> {
        self.with_wifi(|wifi| wifi.connect())
    }

    fn disconnect(&self) -> Result<(), DriverError> {
        self.with_wifi(|wifi| wifi.disconnect())
    }

    // Dropping the EspWifi in `deinit` already detached the netif and its default handlers.
    fn clear_default_handlers(&self, _netif: NetifId) -> Result<(), DriverError> {
        Ok(())
    }
}
