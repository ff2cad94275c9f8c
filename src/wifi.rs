//! WiFi station lifecycle.
//!
//! [`NetworkManager`] is a runtime-wide singleton. Creating it brings the
//! station interface up and, when credentials were persisted by an earlier
//! provisioning run, connects with them. The driver reports progress through
//! events; disconnects are answered with an immediate reconnect. Dropping the
//! last reference tears the driver back down.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::error::{tolerate_invalid_state, DriverError, HandleStatus};
use crate::event::{
    copy_clamped, ip_event, subscribe, wifi_event, EventBase, EventBus, EventData, EventHandler,
    Subscription, VendorCredentials, ANY_ID,
};
use crate::handle::{Netif, NetifId};
use crate::runtime::Runtime;
use crate::storage::CredentialStore;
use crate::sync::{EventBits, EventGroup, Timeout};
use crate::task::{self, Task, TaskConfig, TASK_STOP_BIT};

pub const CONNECTED_BIT: EventBits = EventBits::bit(0);

const TASK: TaskConfig = TaskConfig::new(c"Wifi", 4096, 3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiState {
    Idle,
    NetifInitialised,
    Started,
    Connected, // associated with the AP, no address yet
    GotIp,
    Done, // the connection watcher has seen the link come up
    Error,
}

/// Station configuration in the driver's layout.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub ssid: [u8; 32],
    pub password: [u8; 64],
    pub bssid: Option<[u8; 6]>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ssid: [0; 32],
            password: [0; 64],
            bssid: None,
        }
    }
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..len]
}

impl ClientConfig {
    pub fn new(ssid: &str, password: &str) -> Self {
        let mut config = Self::default();
        copy_clamped(&mut config.ssid, ssid.as_bytes());
        copy_clamped(&mut config.password, password.as_bytes());
        config
    }

    /// Decode provisioning credentials. Fields are copied up to the smaller
    /// of the two buffer sizes; the BSSID only when the sender pinned one.
    pub fn from_vendor(creds: &VendorCredentials) -> Self {
        let mut config = Self::default();
        copy_clamped(&mut config.ssid, &creds.ssid);
        copy_clamped(&mut config.password, &creds.password);
        if creds.bssid_set {
            let mut bssid = [0; 6];
            copy_clamped(&mut bssid, &creds.bssid);
            config.bssid = Some(bssid);
        }
        config
    }

    pub fn ssid_bytes(&self) -> &[u8] {
        until_nul(&self.ssid)
    }

    pub fn password_bytes(&self) -> &[u8] {
        until_nul(&self.password)
    }

    /// The SSID as text, or `None` when it is not valid UTF-8.
    pub fn ssid_text(&self) -> Option<&str> {
        std::str::from_utf8(self.ssid_bytes()).ok()
    }

    pub fn password_text(&self) -> Option<&str> {
        std::str::from_utf8(self.password_bytes()).ok()
    }

    /// For logs only: invalid bytes are replaced.
    pub fn ssid_str(&self) -> String {
        String::from_utf8_lossy(self.ssid_bytes()).into_owned()
    }

    pub fn password_str(&self) -> String {
        String::from_utf8_lossy(self.password_bytes()).into_owned()
    }

    pub fn is_complete(&self) -> bool {
        !self.ssid_bytes().is_empty() && !self.password_bytes().is_empty()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("ssid", &self.ssid_str())
            .field("password", &format_args!("[{} bytes]", self.password_bytes().len()))
            .field("bssid", &self.bssid)
            .finish()
    }
}

/// The vendor WiFi driver in station mode.
pub trait WifiDriver: Send + Sync {
    fn netif_init(&self) -> Result<(), DriverError>;
    fn create_default_sta_netif(&self) -> Result<Netif, DriverError>;
    fn init(&self) -> Result<(), DriverError>;
    fn set_mode_sta(&self) -> Result<(), DriverError>;
    fn start(&self) -> Result<(), DriverError>;
    fn stop(&self) -> Result<(), DriverError>;
    fn deinit(&self) -> Result<(), DriverError>;
    fn set_config(&self, config: &ClientConfig) -> Result<(), DriverError>;
    fn get_config(&self) -> Result<ClientConfig, DriverError>;
    fn connect(&self) -> Result<(), DriverError>;
    fn disconnect(&self) -> Result<(), DriverError>;
    fn clear_default_handlers(&self, netif: NetifId) -> Result<(), DriverError>;
}

/// Construction options. Only the call that actually creates the manager
/// applies them; an existing instance is returned unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiOptions {
    pub clear_credentials_on_construction: bool,
}

impl Default for WifiOptions {
    fn default() -> Self {
        Self {
            clear_credentials_on_construction: cfg!(feature = "clear-wifi-nvs"),
        }
    }
}

pub struct NetworkManager {
    driver: Arc<dyn WifiDriver>,
    state: Mutex<WifiState>,
    credentials: Mutex<CredentialStore>,
    netif: Mutex<Netif>,
    event_group: EventGroup,
    subscriptions: Mutex<Vec<Subscription>>,
    task: Mutex<Option<Task>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NetworkManager {
    pub fn get_shared(rt: &Runtime) -> Result<Arc<Self>> {
        Self::get_shared_with(rt, WifiOptions::default())
    }

    pub fn get_shared_with(rt: &Runtime, options: WifiOptions) -> Result<Arc<Self>> {
        rt.network().get_or_try_create(|| Self::create(rt, options))
    }

    /// The live instance, if any, without creating one.
    pub fn get_weak(rt: &Runtime) -> Weak<Self> {
        rt.network().get_weak()
    }

    fn create(rt: &Runtime, options: WifiOptions) -> Result<Arc<Self>> {
        debug!("Constructing instance");
        let services = rt.services();
        let driver = services.wifi.clone();

        // Credentials from an earlier provisioning run, if any
        let mut credentials = CredentialStore::open(services.storage.as_ref())
            .context("Failed to open the WiFi NVS namespace")?;
        if options.clear_credentials_on_construction {
            warn!("Clearing stored WiFi credentials on construction");
            credentials.erase();
        }

        // Network interface and event loop come first; both outlive this instance
        if rt.take_netif_init() {
            driver.netif_init().context("esp_netif_init failed")?;
        }

        tolerate_invalid_state(services.events.create_default_loop())
            .context("Failed to create the default event loop")?;

        let netif = driver
            .create_default_sta_netif()
            .context("Failed to create the default STA netif")?;

        let event_group = EventGroup::new().context("Failed to allocate the WiFi event group")?;

        let manager = Arc::new(Self {
            driver: driver.clone(),
            state: Mutex::new(WifiState::NetifInitialised),
            credentials: Mutex::new(credentials),
            netif: Mutex::new(netif),
            event_group,
            subscriptions: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });

        // Handlers go in before the driver starts so STA_START is not missed
        manager
            .subscribe(&services.events)
            .context("Failed to register WiFi event handlers")?;

        // Bring the radio up in station mode
        driver.init().context("esp_wifi_init failed")?;
        driver.set_mode_sta().context("esp_wifi_set_mode failed")?;
        driver.start().context("esp_wifi_start failed")?;
        manager.set_state(WifiState::Started);
        info!("📶 WiFi station started");

        manager.connect_stored();

        Ok(manager)
    }

    fn subscribe(self: &Arc<Self>, events: &Arc<dyn EventBus>) -> Result<(), DriverError> {
        let wifi = subscribe(events, EventBase::Wifi, ANY_ID, self.event_handler())?;
        let ip = subscribe(events, EventBase::Ip, ip_event::STA_GOT_IP, self.event_handler())?;
        lock(&self.subscriptions).extend([wifi, ip]);
        Ok(())
    }

    // Handlers only hold a weak reference and resolve it per event.
    fn event_handler(self: &Arc<Self>) -> EventHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |base: EventBase, id: i32, data: &EventData| {
            let Some(manager) = weak.upgrade() else {
                warn!("Event {}:{} ignored; no instance of this class exists", base, id);
                return;
            };

            let status = match base {
                EventBase::Wifi => manager.handle_wifi_event(id, data),
                EventBase::Ip => manager.handle_ip_event(id, data),
                EventBase::SmartConfig => HandleStatus::Unhandled,
            };
            if status == HandleStatus::Unhandled {
                warn!("Unhandled {} {}", base, id);
            }
        })
    }

    fn connect_stored(&self) {
        let (ssid, password) = {
            let mut credentials = lock(&self.credentials);
            (credentials.ssid(), credentials.password())
        };

        if ssid.is_empty() || password.is_empty() {
            info!("No stored WiFi credentials");
            return;
        }

        info!("📶 Connecting to stored network {}", ssid);
        let config = ClientConfig::new(&ssid, &password);
        if let Err(e) = self.driver.set_config(&config) {
            error!("Failed to apply stored config: {}", e);
            return;
        }
        if let Err(e) = self.driver.connect() {
            error!("Failed to connect with stored config: {}", e);
        }
    }

    fn handle_wifi_event(self: &Arc<Self>, id: i32, data: &EventData) -> HandleStatus {
        match id {
            wifi_event::STA_START => {
                self.spawn_watcher();
                HandleStatus::Ok
            }
            wifi_event::STA_CONNECTED => {
                self.set_state(WifiState::Connected);
                info!("🔗 Connected");
                HandleStatus::Ok
            }
            wifi_event::STA_DISCONNECTED => {
                if let EventData::Disconnected { reason } = data {
                    info!("⚠️ Disconnected (reason {}), reconnecting", reason);
                }
                if let Err(e) = self.driver.connect() {
                    warn!("Reconnect attempt rejected: {}", e);
                }
                self.event_group.clear_bits(CONNECTED_BIT);
                HandleStatus::Ok
            }
            _ => HandleStatus::Unhandled,
        }
    }

    fn handle_ip_event(&self, id: i32, data: &EventData) -> HandleStatus {
        match id {
            ip_event::STA_GOT_IP => {
                if let EventData::GotIp { ip } = data {
                    info!("🌐 Got IP {}", ip);
                }
                self.set_state(WifiState::GotIp);
                self.event_group.set_bits(CONNECTED_BIT);
                HandleStatus::Ok
            }
            _ => HandleStatus::Unhandled,
        }
    }

    fn spawn_watcher(self: &Arc<Self>) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!("Connection watcher already running");
            return;
        }

        let group = self.event_group.clone();
        let weak = Arc::downgrade(self);
        match Task::spawn(&TASK, move || Self::watch_connection(group, weak)) {
            Ok(spawned) => {
                info!("Started task {}", spawned.name());
                // Reaps the previous, finished watcher.
                *task = Some(spawned);
            }
            Err(e) => {
                error!("{:#}", e);
                self.set_state(WifiState::Error);
            }
        }
    }

    fn watch_connection(group: EventGroup, manager: Weak<Self>) {
        loop {
            let result = group.wait_bits(CONNECTED_BIT | TASK_STOP_BIT, true, false, Timeout::FOREVER);
            if !result.success {
                continue;
            }
            if result.bits.contains(TASK_STOP_BIT) {
                debug!("Connection watcher stopping");
                return;
            }

            let Some(manager) = manager.upgrade() else {
                return;
            };
            match manager.active_config() {
                Some(config) => info!("✅ WiFi Connected to AP {}", config.ssid_str()),
                None => info!("✅ WiFi Connected"),
            }
            manager.set_state(WifiState::Done);
            task::log_stack_usage(&TASK);
            return;
        }
    }

    pub fn state(&self) -> WifiState {
        *lock(&self.state)
    }

    fn set_state(&self, state: WifiState) {
        *lock(&self.state) = state;
    }

    /// Switch to `config`. The disconnect status is ignored, since
    /// disconnecting while not connected is expected.
    pub fn reconnect_to(&self, config: &ClientConfig) -> bool {
        if let Err(e) = self.driver.disconnect() {
            debug!("Disconnect before reconnect: {}", e);
        }

        if let Err(e) = self.driver.set_config(config) {
            error!("Failed to set config: {}", e);
            return false;
        }

        if let Err(e) = self.driver.connect() {
            error!("Failed to connect: {}", e);
            return false;
        }

        true
    }

    pub fn disconnect(&self) -> bool {
        match self.driver.disconnect() {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                false
            }
        }
    }

    /// The configuration the driver is currently using.
    pub fn active_config(&self) -> Option<ClientConfig> {
        match self.driver.get_config() {
            Ok(config) => Some(config),
            Err(e) => {
                error!("Failed to read the active config: {}", e);
                None
            }
        }
    }

    pub fn stored_ssid(&self) -> String {
        lock(&self.credentials).ssid()
    }

    pub fn stored_password(&self) -> String {
        lock(&self.credentials).password()
    }

    /// Persist `config`. Fields that are not valid UTF-8 cannot be stored as
    /// NVS strings, so such a config is refused rather than stored altered.
    pub fn store_credentials(&self, config: &ClientConfig) -> bool {
        let (Some(ssid), Some(password)) = (config.ssid_text(), config.password_text()) else {
            error!(
                "❌ Credentials for {} are not valid UTF-8, not saving them",
                config.ssid_str()
            );
            return false;
        };
        lock(&self.credentials).store(ssid, password)
    }

    pub fn erase_credentials(&self) -> bool {
        lock(&self.credentials).erase()
    }

    pub fn erase_stored_ssid(&self) -> bool {
        lock(&self.credentials).erase_ssid()
    }

    pub fn erase_stored_password(&self) -> bool {
        lock(&self.credentials).erase_password()
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        debug!("Deconstructing instance");

        // Stop the connection watcher before the driver goes away
        if let Some(mut task) = lock(&self.task).take() {
            task.stop(&self.event_group);
        }

        // Tear the driver down in reverse order; failures here are only logged
        let steps: [(&str, fn(&dyn WifiDriver) -> Result<(), DriverError>); 3] = [
            ("esp_wifi_disconnect", |d| d.disconnect()),
            ("esp_wifi_stop", |d| d.stop()),
            ("esp_wifi_deinit", |d| d.deinit()),
        ];
        for (name, step) in steps {
            debug!("{}", name);
            if let Err(e) = step(self.driver.as_ref()) {
                debug!("{} returned {}", name, e);
            }
        }

        let mut netif = lock(&self.netif);
        if let Some(&id) = netif.get() {
            if let Err(e) = self.driver.clear_default_handlers(id) {
                warn!("Failed to clear default WiFi handlers: {}", e);
            }
        }

        // Unregister our handlers, then release the netif
        lock(&self.subscriptions).clear();
        netif.reset();

        *lock(&self.state) = WifiState::Idle;
        info!("📴 Wifi deconstructed");
    }
}
