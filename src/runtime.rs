//! Collaborator services and the singleton slots that share them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::event::EventBus;
use crate::singleton::Singleton;
use crate::smartconfig::{ProvisioningSession, SmartConfigService};
use crate::storage::KeyValueStore;
use crate::wifi::{NetworkManager, WifiDriver};

#[derive(Clone)]
pub struct Services {
    pub wifi: Arc<dyn WifiDriver>,
    pub events: Arc<dyn EventBus>,
    pub storage: Arc<dyn KeyValueStore>,
    pub smartconfig: Arc<dyn SmartConfigService>,
}

pub struct Runtime {
    services: Services,
    network: Singleton<NetworkManager>,
    provisioning: Singleton<ProvisioningSession>,
    netif_initialised: AtomicBool,
}

impl Runtime {
    pub fn new(services: Services) -> Arc<Self> {
        Arc::new(Self {
            services,
            network: Singleton::new(),
            provisioning: Singleton::new(),
            netif_initialised: AtomicBool::new(false),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub(crate) fn network(&self) -> &Singleton<NetworkManager> {
        &self.network
    }

    pub(crate) fn provisioning(&self) -> &Singleton<ProvisioningSession> {
        &self.provisioning
    }

    /// True exactly once per runtime: the caller must initialise the netif layer.
    pub(crate) fn take_netif_init(&self) -> bool {
        !self.netif_initialised.swap(true, Ordering::AcqRel)
    }
}
