//! Persistent key-value storage (NVS on device).
//!
//! [`StorageSession`] owns an open namespace and closes it when dropped.
//! [`CredentialStore`] layers the WiFi credential record on top of it.

use log::{debug, error, info, warn};

use crate::error::DriverError;

pub const NVS_NAMESPACE: &str = "wifi";
pub const SSID_KEY: &str = "ssid";
pub const PASSWORD_KEY: &str = "password";

/// A storage partition that namespaces can be opened on.
pub trait KeyValueStore: Send + Sync {
    fn open(&self, namespace: &str) -> Result<Box<dyn KeyValueSession>, DriverError>;
}

/// One open namespace. Closed when dropped.
pub trait KeyValueSession: Send {
    /// `Ok(None)` when the key does not exist.
    fn get_string(&mut self, key: &str) -> Result<Option<String>, DriverError>;
    fn set_string(&mut self, key: &str, value: &str) -> Result<(), DriverError>;
    fn erase_key(&mut self, key: &str) -> Result<(), DriverError>;
    fn commit(&mut self) -> Result<(), DriverError>;
}

pub struct StorageSession {
    namespace: String,
    raw: Box<dyn KeyValueSession>,
}

impl StorageSession {
    pub fn open(store: &dyn KeyValueStore, namespace: &str) -> Result<Self, DriverError> {
        let raw = store.open(namespace).map_err(|e| {
            error!("Failed to open NVS namespace {}: {}", namespace, e);
            e
        })?;
        info!("Opened NVS namespace {}", namespace);

        Ok(Self {
            namespace: namespace.to_string(),
            raw,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The stored value, or an empty string when absent or unreadable.
    pub fn get_string(&mut self, key: &str) -> String {
        match self.raw.get_string(key) {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("No existing key {} in NVS {}", key, self.namespace);
                String::new()
            }
            Err(e) => {
                debug!("Failed to read {} from NVS {}: {}", key, self.namespace, e);
                String::new()
            }
        }
    }

    pub fn set_string(&mut self, key: &str, value: &str) -> bool {
        self.write(key, value) && self.commit()
    }

    /// Write every pair, then commit once. Stops at the first failed write.
    pub fn set_strings(&mut self, pairs: &[(&str, &str)]) -> bool {
        pairs.iter().all(|(key, value)| self.write(key, value)) && self.commit()
    }

    // Values that are already stored are not rewritten.
    fn write(&mut self, key: &str, value: &str) -> bool {
        if self.get_string(key) == value {
            info!(
                "Not setting {} in NVS {} since it's already set to that",
                key, self.namespace
            );
            return true;
        }

        match self.raw.set_string(key, value) {
            Ok(()) => {
                info!("Set {} in NVS {}", key, self.namespace);
                true
            }
            Err(e) => {
                error!("Failed to set {} in NVS {}: {}", key, self.namespace, e);
                false
            }
        }
    }

    pub fn erase_key(&mut self, key: &str) -> bool {
        self.erase(key) && self.commit()
    }

    /// Erase every key, then commit once.
    pub fn erase_keys(&mut self, keys: &[&str]) -> bool {
        keys.iter().all(|key| self.erase(key)) && self.commit()
    }

    fn erase(&mut self, key: &str) -> bool {
        match self.raw.erase_key(key) {
            Ok(()) => {
                info!("Erased {} from NVS {}", key, self.namespace);
                true
            }
            Err(e) if e == DriverError::NVS_NOT_FOUND => {
                debug!("{} was not present in NVS {}", key, self.namespace);
                true
            }
            Err(e) => {
                error!("Failed to erase {} from NVS {}: {}", key, self.namespace, e);
                false
            }
        }
    }

    pub fn commit(&mut self) -> bool {
        match self.raw.commit() {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to commit NVS {}: {}", self.namespace, e);
                false
            }
        }
    }
}

impl Drop for StorageSession {
    fn drop(&mut self) {
        debug!("Closing NVS namespace {}", self.namespace);
    }
}

/// The persisted WiFi credential record.
pub struct CredentialStore {
    session: StorageSession,
}

impl CredentialStore {
    pub fn open(store: &dyn KeyValueStore) -> Result<Self, DriverError> {
        Ok(Self {
            session: StorageSession::open(store, NVS_NAMESPACE)?,
        })
    }

    pub fn ssid(&mut self) -> String {
        self.session.get_string(SSID_KEY)
    }

    pub fn password(&mut self) -> String {
        self.session.get_string(PASSWORD_KEY)
    }

    /// Both fields present and non-empty.
    pub fn has_credentials(&mut self) -> bool {
        !self.ssid().is_empty() && !self.password().is_empty()
    }

    pub fn store(&mut self, ssid: &str, password: &str) -> bool {
        info!("💾 Storing WiFi credentials for SSID: {}", ssid);
        self.session
            .set_strings(&[(SSID_KEY, ssid), (PASSWORD_KEY, password)])
    }

    pub fn erase(&mut self) -> bool {
        warn!("🧹 Clearing stored WiFi credentials");
        self.session.erase_keys(&[SSID_KEY, PASSWORD_KEY])
    }

    pub fn erase_ssid(&mut self) -> bool {
        self.session.erase_key(SSID_KEY)
    }

    pub fn erase_password(&mut self) -> bool {
        self.session.erase_key(PASSWORD_KEY)
    }
}

/// Log-safe rendering of a credential pair.
pub fn format_credentials_for_display(ssid: &str, password: &str) -> String {
    format!("SSID: '{}', Password: [{} chars]", ssid, password.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryStore;

    #[test]
    fn absent_keys_read_as_empty() {
        let store = MemoryStore::new();
        let mut creds = CredentialStore::open(&store).unwrap();
        assert_eq!(creds.ssid(), "");
        assert_eq!(creds.password(), "");
        assert!(!creds.has_credentials());
    }

    #[test]
    fn store_then_read_back() {
        let store = MemoryStore::new();
        let mut creds = CredentialStore::open(&store).unwrap();
        assert!(creds.store("home", "hunter22"));
        assert_eq!(creds.ssid(), "home");
        assert_eq!(creds.password(), "hunter22");
        assert!(creds.has_credentials());

        // A second session on the same partition sees the record.
        let mut other = CredentialStore::open(&store).unwrap();
        assert_eq!(other.ssid(), "home");
    }

    #[test]
    fn pairs_commit_once_and_unchanged_values_are_skipped() {
        let store = MemoryStore::new();
        let mut creds = CredentialStore::open(&store).unwrap();

        assert!(creds.store("home", "hunter22"));
        assert_eq!(store.commits(), 1);
        assert_eq!(store.writes(), 2);

        assert!(creds.store("home", "changed!"));
        assert_eq!(store.commits(), 2);
        assert_eq!(store.writes(), 3);
    }

    #[test]
    fn erase_single_and_both() {
        let store = MemoryStore::new();
        let mut creds = CredentialStore::open(&store).unwrap();
        creds.store("home", "hunter22");

        assert!(creds.erase_password());
        assert_eq!(creds.ssid(), "home");
        assert_eq!(creds.password(), "");

        let commits = store.commits();
        assert!(creds.erase());
        assert_eq!(store.commits(), commits + 1);
        assert_eq!(creds.ssid(), "");
    }

    #[test]
    fn unavailable_partition_fails_open() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(CredentialStore::open(&store).is_err());
    }

    #[test]
    fn display_hides_password() {
        assert_eq!(
            format_credentials_for_display("home", "hunter22"),
            "SSID: 'home', Password: [8 chars]"
        );
    }
}
