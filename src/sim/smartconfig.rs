use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::info;

use crate::error::DriverError;
use crate::event::{sc_event, EventBase, EventData, VendorCredentials};
use crate::smartconfig::{SmartConfigKind, SmartConfigService, SmartConfigStart};

use super::events::SimEventLoop;

#[derive(Default)]
struct Provisioner {
    kind: SmartConfigKind,
    running: bool,
    start_failure: Option<DriverError>,
    extra_data: Vec<u8>,
    extra_data_reads: usize,
}

/// Provisioning service driven from the host side: [`SimSmartConfig::deliver`]
/// plays the phone sending credentials, [`SimSmartConfig::acknowledge`] the
/// phone receiving the ack.
pub struct SimSmartConfig {
    events: Arc<SimEventLoop>,
    state: Mutex<Provisioner>,
}

impl SimSmartConfig {
    pub fn new(events: Arc<SimEventLoop>) -> Arc<Self> {
        Arc::new(Self {
            events,
            state: Mutex::new(Provisioner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Provisioner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn kind(&self) -> SmartConfigKind {
        self.lock().kind
    }

    /// Fail the next start with `error`.
    pub fn fail_start(&self, error: DriverError) {
        self.lock().start_failure = Some(error);
    }

    pub fn set_extra_data(&self, data: Vec<u8>) {
        self.lock().extra_data = data;
    }

    pub fn extra_data_reads(&self) -> usize {
        self.lock().extra_data_reads
    }

    /// Post the events of a phone handing over `ssid`/`password`.
    /// Returns false when discovery is not running.
    pub fn deliver(&self, ssid: &str, password: &str) -> bool {
        let kind = {
            let state = self.lock();
            if !state.running {
                return false;
            }
            state.kind
        };

        let creds = VendorCredentials::new(ssid.as_bytes(), password.as_bytes(), kind);
        self.events
            .post(EventBase::SmartConfig, sc_event::FOUND_CHANNEL, EventData::None);
        self.events.post(
            EventBase::SmartConfig,
            sc_event::GOT_SSID_PSWD,
            EventData::GotSsidPassword(creds),
        );
        true
    }

    pub fn acknowledge(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.events
            .post(EventBase::SmartConfig, sc_event::SEND_ACK_DONE, EventData::None);
        true
    }
}

impl SmartConfigService for SimSmartConfig {
    fn set_kind(&self, kind: SmartConfigKind) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.running {
            return Err(DriverError::INVALID_STATE);
        }
        state.kind = kind;
        Ok(())
    }

    fn start(&self, config: &SmartConfigStart) -> Result<(), DriverError> {
        {
            let mut state = self.lock();
            if let Some(e) = state.start_failure.take() {
                return Err(e);
            }
            if state.running {
                return Err(DriverError::INVALID_STATE);
            }
            state.running = true;
        }
        if config.enable_log {
            info!("{} discovery listening", config.kind);
        }
        self.events
            .post(EventBase::SmartConfig, sc_event::SCAN_DONE, EventData::None);
        Ok(())
    }

    fn stop(&self) -> Result<(), DriverError> {
        self.lock().running = false;
        Ok(())
    }

    fn extra_data(&self) -> Result<Vec<u8>, DriverError> {
        let mut state = self.lock();
        state.extra_data_reads += 1;
        Ok(state.extra_data.clone())
    }
}
