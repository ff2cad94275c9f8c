//! ESPTouch provisioning session.
//!
//! While a [`ProvisioningSession`] is alive the provisioner listens for a
//! phone broadcasting WiFi credentials. Received credentials are applied to
//! the [`NetworkManager`] right away; once the phone has been acknowledged,
//! the session task persists the active configuration and the session ends.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::error::{DriverError, HandleStatus};
use crate::event::{sc_event, subscribe, EventBase, EventData, EventHandler, Subscription, ANY_ID};
use crate::runtime::Runtime;
use crate::storage::format_credentials_for_display;
use crate::sync::{EventBits, EventGroup, Timeout};
use crate::task::{self, Task, TaskConfig, TASK_STOP_BIT};
use crate::wifi::{ClientConfig, NetworkManager};

pub const ESPTOUCH_DONE_BIT: EventBits = EventBits::bit(1);

const TASK: TaskConfig = TaskConfig::new(c"SmartConfig", 4096, 3);

/// Provisioning protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmartConfigKind {
    #[default]
    EspTouch,
    AirKiss,
    EspTouchAirKiss,
    EspTouchV2,
}

impl fmt::Display for SmartConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EspTouch => "ESPTouch",
            Self::AirKiss => "AirKiss",
            Self::EspTouchAirKiss => "ESPTouch+AirKiss",
            Self::EspTouchV2 => "ESPTouch v2",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmartConfigState {
    Idle,
    Started,
    Connected,
    Done,
    Error,
}

/// Start parameters for the provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmartConfigStart {
    pub kind: SmartConfigKind,
    pub enable_log: bool,
    pub esp_touch_v2_enable_crypt: bool,
    pub esp_touch_v2_key: Option<[u8; 16]>,
}

/// The vendor provisioning service.
pub trait SmartConfigService: Send + Sync {
    fn set_kind(&self, kind: SmartConfigKind) -> Result<(), DriverError>;
    fn start(&self, config: &SmartConfigStart) -> Result<(), DriverError>;
    fn stop(&self) -> Result<(), DriverError>;
    /// ESPTouch v2 reserved data sent along with the credentials.
    fn extra_data(&self) -> Result<Vec<u8>, DriverError>;
}

pub struct ProvisioningSession {
    provisioner: Arc<dyn SmartConfigService>,
    state: Mutex<SmartConfigState>,
    subscription: Mutex<Option<Subscription>>,
    task: Mutex<Option<Task>>,
    event_group: EventGroup,
    wifi: Arc<NetworkManager>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProvisioningSession {
    pub fn get_shared(rt: &Runtime) -> Result<Arc<Self>> {
        Self::get_shared_with(rt, SmartConfigStart::default())
    }

    /// `start` only applies when this call creates the session.
    pub fn get_shared_with(rt: &Runtime, start: SmartConfigStart) -> Result<Arc<Self>> {
        rt.provisioning()
            .get_or_try_create(|| Self::create(rt, start))
    }

    pub fn get_weak(rt: &Runtime) -> Weak<Self> {
        rt.provisioning().get_weak()
    }

    fn create(rt: &Runtime, start: SmartConfigStart) -> Result<Arc<Self>> {
        debug!("Constructing instance");

        // Credentials are applied to the shared WiFi manager
        let wifi = NetworkManager::get_shared(rt)?;
        let event_group =
            EventGroup::new().context("Failed to allocate the SmartConfig event group")?;

        let session = Arc::new(Self {
            provisioner: rt.services().smartconfig.clone(),
            state: Mutex::new(SmartConfigState::Idle),
            subscription: Mutex::new(None),
            task: Mutex::new(None),
            event_group,
            wifi,
        });

        // Listen for the phone before discovery starts
        let subscription = subscribe(
            &rt.services().events,
            EventBase::SmartConfig,
            ANY_ID,
            session.event_handler(),
        )
        .context("Failed to register the SC_EVENT handler")?;
        *lock(&session.subscription) = Some(subscription);

        // The task waits for the phone's ack, then saves what connected
        let group = session.event_group.clone();
        let weak = Arc::downgrade(&session);
        let spawned = Task::spawn(&TASK, move || Self::await_ack(group, weak))?;
        info!("Started task {}", spawned.name());
        *lock(&session.task) = Some(spawned);

        session
            .provisioner
            .set_kind(start.kind)
            .context("esp_smartconfig_set_type failed")?;
        session
            .provisioner
            .start(&start)
            .context("esp_smartconfig_start failed")?;
        session.set_state(SmartConfigState::Started);
        info!("📡 {} discovery started", start.kind);

        Ok(session)
    }

    fn event_handler(self: &Arc<Self>) -> EventHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |base: EventBase, id: i32, data: &EventData| {
            let Some(session) = weak.upgrade() else {
                warn!("Event {}:{} ignored; no instance of this class exists", base, id);
                return;
            };

            let status = match base {
                EventBase::SmartConfig => session.handle_event(id, data),
                _ => HandleStatus::Unhandled,
            };
            if status != HandleStatus::Ok {
                warn!("Event {} unhandled with status {:?}", id, status);
            }
        })
    }

    pub fn handle_event(&self, id: i32, data: &EventData) -> HandleStatus {
        match id {
            sc_event::SCAN_DONE => {
                debug!("Scan done");
                HandleStatus::Ok
            }
            sc_event::FOUND_CHANNEL => {
                debug!("Found channel");
                HandleStatus::Ok
            }
            sc_event::GOT_SSID_PSWD => self.apply_credentials(data),
            sc_event::SEND_ACK_DONE => {
                self.event_group.set_bits(ESPTOUCH_DONE_BIT);
                HandleStatus::Ok
            }
            _ => HandleStatus::Unhandled,
        }
    }

    fn apply_credentials(&self, data: &EventData) -> HandleStatus {
        let EventData::GotSsidPassword(creds) = data else {
            warn!("SC_EVENT_GOT_SSID_PSWD without credentials");
            return HandleStatus::Failed;
        };
        info!("📱 Got SSID and password");

        let config = ClientConfig::from_vendor(creds);
        info!("SSID:{}", config.ssid_str());
        debug!("PASSWORD:{}", config.password_str());

        if creds.kind == SmartConfigKind::EspTouchV2 {
            match self.provisioner.extra_data() {
                Ok(extra) => info!("Reserved data: {} bytes", extra.len()),
                Err(e) => warn!("Failed to read reserved data: {}", e),
            }
        }

        if !config.is_complete() {
            warn!("SSID or password is empty");
            return HandleStatus::Failed;
        }

        // Only text survives the trip through NVS; refuse what could not be saved as sent.
        if config.ssid_text().is_none() || config.password_text().is_none() {
            warn!("SSID or password is not valid UTF-8");
            return HandleStatus::Failed;
        }

        if !self.wifi.reconnect_to(&config) {
            warn!("Failed to reconnect");
            return HandleStatus::Failed;
        }

        self.set_state(SmartConfigState::Connected);
        HandleStatus::Ok
    }

    fn await_ack(group: EventGroup, session: Weak<Self>) {
        loop {
            let result =
                group.wait_bits(ESPTOUCH_DONE_BIT | TASK_STOP_BIT, true, false, Timeout::FOREVER);
            if !result.success {
                continue;
            }
            if result.bits.contains(TASK_STOP_BIT) {
                debug!("SmartConfig task stopping");
                return;
            }

            if let Some(session) = session.upgrade() {
                session.finish();
            }
            return;
        }
    }

    fn finish(&self) {
        // Save what the driver is using now, not what the phone first sent
        match self.wifi.active_config() {
            Some(config) if config.is_complete() => {
                info!(
                    "💾 Saving creds to NVS, {}",
                    format_credentials_for_display(&config.ssid_str(), &config.password_str())
                );
                if !self.wifi.store_credentials(&config) {
                    error!("Failed to save credentials for {}", config.ssid_str());
                }
            }
            _ => error!("❌ Active WiFi config is incomplete, credentials not saved"),
        }

        // Discovery ends whether or not the save worked
        info!("✅ Done!");
        if let Err(e) = self.provisioner.stop() {
            warn!("esp_smartconfig_stop failed: {}", e);
        }
        self.set_state(SmartConfigState::Done);

        task::log_stack_usage(&TASK);
    }

    pub fn state(&self) -> SmartConfigState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SmartConfigState) {
        *lock(&self.state) = state;
    }

    pub fn wifi(&self) -> &Arc<NetworkManager> {
        &self.wifi
    }
}

impl Drop for ProvisioningSession {
    fn drop(&mut self) {
        debug!("Deconstructing instance");

        if let Some(mut task) = lock(&self.task).take() {
            task.stop(&self.event_group);
        }

        if let Err(e) = self.provisioner.stop() {
            debug!("esp_smartconfig_stop returned {}", e);
        }

        lock(&self.subscription).take();
        *lock(&self.state) = SmartConfigState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::VendorCredentials;
    use crate::sim::{SimServices, WifiCall};
    use crate::wifi::WifiDriver;
    use std::time::{Duration, Instant};

    fn wait_until_done(session: &ProvisioningSession) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.state() != SmartConfigState::Done && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(session.state(), SmartConfigState::Done);
    }

    #[test]
    fn construction_starts_discovery_and_shares_wifi() {
        let sim = SimServices::new();
        let rt = sim.runtime();

        let session = ProvisioningSession::get_shared(&rt).unwrap();
        assert_eq!(session.state(), SmartConfigState::Started);
        assert!(sim.smartconfig.is_running());

        let wifi = NetworkManager::get_shared(&rt).unwrap();
        assert!(Arc::ptr_eq(session.wifi(), &wifi));

        let again = ProvisioningSession::get_shared(&rt).unwrap();
        assert!(Arc::ptr_eq(&session, &again));
    }

    #[test]
    fn failed_start_is_fatal() {
        let sim = SimServices::new();
        sim.smartconfig.fail_start(DriverError::FAIL);
        let rt = sim.runtime();

        assert!(ProvisioningSession::get_shared(&rt).is_err());
        assert!(ProvisioningSession::get_weak(&rt).upgrade().is_none());
    }

    #[test]
    fn empty_password_is_rejected_without_reconnect() {
        let sim = SimServices::new();
        let rt = sim.runtime();
        let session = ProvisioningSession::get_shared(&rt).unwrap();
        let set_configs = sim.wifi.count(WifiCall::SetConfig);

        let creds = VendorCredentials::new(b"home", b"", SmartConfigKind::EspTouch);
        assert_eq!(
            session.handle_event(sc_event::GOT_SSID_PSWD, &EventData::GotSsidPassword(creds)),
            HandleStatus::Failed
        );
        assert_eq!(sim.wifi.count(WifiCall::SetConfig), set_configs);
        assert!(!session.event_group.get_bits().contains(ESPTOUCH_DONE_BIT));
        assert_eq!(session.state(), SmartConfigState::Started);
    }

    #[test]
    fn credentials_reconnect_and_ack_persists() {
        let sim = SimServices::new();
        sim.wifi.add_access_point("home", "hunter22");
        let rt = sim.runtime();
        let session = ProvisioningSession::get_shared(&rt).unwrap();

        let creds = VendorCredentials::new(b"home", b"hunter22", SmartConfigKind::EspTouch);
        assert_eq!(
            session.handle_event(sc_event::GOT_SSID_PSWD, &EventData::GotSsidPassword(creds)),
            HandleStatus::Ok
        );
        assert_eq!(session.state(), SmartConfigState::Connected);

        assert_eq!(
            session.handle_event(sc_event::SEND_ACK_DONE, &EventData::None),
            HandleStatus::Ok
        );

        // The session task finishes on its own.
        wait_until_done(&session);
        assert!(!sim.smartconfig.is_running());
        assert_eq!(session.wifi().stored_ssid(), "home");
        assert_eq!(session.wifi().stored_password(), "hunter22");
    }

    #[test]
    fn non_utf8_ssid_is_rejected_without_reconnect() {
        let sim = SimServices::new();
        let rt = sim.runtime();
        let session = ProvisioningSession::get_shared(&rt).unwrap();
        let set_configs = sim.wifi.count(WifiCall::SetConfig);

        let latin1 = [67, 97, 102, 233];
        let creds = VendorCredentials::new(&latin1, b"hunter22", SmartConfigKind::EspTouch);
        assert_eq!(
            session.handle_event(sc_event::GOT_SSID_PSWD, &EventData::GotSsidPassword(creds)),
            HandleStatus::Failed
        );
        assert_eq!(sim.wifi.count(WifiCall::SetConfig), set_configs);
        assert_eq!(session.state(), SmartConfigState::Started);
    }

    #[test]
    fn incomplete_active_config_at_ack_is_not_saved() {
        let sim = SimServices::new();
        let rt = sim.runtime();
        let session = ProvisioningSession::get_shared(&rt).unwrap();

        // The driver holds an SSID but no password when the phone acknowledges.
        sim.wifi.set_config(&ClientConfig::new("home", "")).unwrap();
        assert_eq!(
            session.handle_event(sc_event::SEND_ACK_DONE, &EventData::None),
            HandleStatus::Ok
        );

        wait_until_done(&session);
        assert!(!sim.smartconfig.is_running());
        assert_eq!(sim.storage.value("wifi", "ssid"), None);
        assert_eq!(sim.storage.value("wifi", "password"), None);
    }

    #[test]
    fn esptouch_v2_reads_reserved_data() {
        let sim = SimServices::new();
        sim.smartconfig.set_extra_data(b"token".to_vec());
        let rt = sim.runtime();
        let session = ProvisioningSession::get_shared(&rt).unwrap();

        let creds = VendorCredentials::new(b"home", b"hunter22", SmartConfigKind::EspTouchV2);
        session.handle_event(sc_event::GOT_SSID_PSWD, &EventData::GotSsidPassword(creds));
        assert_eq!(sim.smartconfig.extra_data_reads(), 1);
    }

    #[test]
    fn unknown_ids_are_unhandled() {
        let sim = SimServices::new();
        let rt = sim.runtime();
        let session = ProvisioningSession::get_shared(&rt).unwrap();

        assert_eq!(session.handle_event(42, &EventData::None), HandleStatus::Unhandled);
        assert_eq!(
            session.handle_event(sc_event::SCAN_DONE, &EventData::None),
            HandleStatus::Ok
        );
    }

    #[test]
    fn teardown_stops_task_and_discovery() {
        let sim = SimServices::new();
        let rt = sim.runtime();
        let session = ProvisioningSession::get_shared(&rt).unwrap();
        sim.events.flush();
        drop(session);

        assert!(!sim.smartconfig.is_running());
        assert!(ProvisioningSession::get_weak(&rt).upgrade().is_none());
        // The session held the only WiFi reference.
        assert!(NetworkManager::get_weak(&rt).upgrade().is_none());
        assert_eq!(sim.events.handler_count(), 0);
    }
}
