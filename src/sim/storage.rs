use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::DriverError;
use crate::storage::{KeyValueSession, KeyValueStore};

// NVS limits: 15 character keys and namespaces.
const MAX_KEY_LEN: usize = 15;

type Entries = BTreeMap<(String, String), String>;

#[derive(Default)]
struct Partition {
    entries: Mutex<Entries>,
    available: AtomicBool,
    writes: AtomicUsize,
    commits: AtomicUsize,
}

/// In-memory NVS partition. Clones share the same contents.
///
/// Writes become visible to other sessions immediately, like `nvs_set_str`
/// on a partition opened read-write.
#[derive(Clone)]
pub struct MemoryStore {
    partition: Arc<Partition>,
}

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        let partition = Partition::default();
        partition.available.store(true, Ordering::Relaxed);
        Self {
            partition: Arc::new(partition),
        }
    }

    /// Put a value in place without counting it as a write.
    pub fn seed(&self, namespace: &str, key: &str, value: &str) {
        lock(&self.partition.entries).insert(
            (namespace.to_string(), key.to_string()),
            value.to_string(),
        );
    }

    pub fn value(&self, namespace: &str, key: &str) -> Option<String> {
        lock(&self.partition.entries)
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    /// An unavailable partition refuses to open, as an uninitialised NVS does.
    pub fn set_available(&self, available: bool) {
        self.partition.available.store(available, Ordering::Relaxed);
    }

    pub fn writes(&self) -> usize {
        self.partition.writes.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> usize {
        self.partition.commits.load(Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn open(&self, namespace: &str) -> Result<Box<dyn KeyValueSession>, DriverError> {
        if !self.partition.available.load(Ordering::Relaxed) {
            return Err(DriverError::NVS_NOT_INITIALIZED);
        }
        if namespace.is_empty() || namespace.len() > MAX_KEY_LEN {
            return Err(DriverError::INVALID_ARG);
        }

        Ok(Box::new(MemorySession {
            namespace: namespace.to_string(),
            partition: self.partition.clone(),
        }))
    }
}

struct MemorySession {
    namespace: String,
    partition: Arc<Partition>,
}

impl MemorySession {
    fn entry(&self, key: &str) -> Result<(String, String), DriverError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(DriverError::INVALID_ARG);
        }
        Ok((self.namespace.clone(), key.to_string()))
    }
}

impl KeyValueSession for MemorySession {
    fn get_string(&mut self, key: &str) -> Result<Option<String>, DriverError> {
        let entry = self.entry(key)?;
        Ok(lock(&self.partition.entries).get(&entry).cloned())
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), DriverError> {
        let entry = self.entry(key)?;
        lock(&self.partition.entries).insert(entry, value.to_string());
        self.partition.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn erase_key(&mut self, key: &str) -> Result<(), DriverError> {
        let entry = self.entry(key)?;
        match lock(&self.partition.entries).remove(&entry) {
            Some(_) => Ok(()),
            None => Err(DriverError::NVS_NOT_FOUND),
        }
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.partition.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_are_isolated() {
        let store = MemoryStore::new();
        let mut wifi = store.open("wifi").unwrap();
        let mut other = store.open("other").unwrap();

        wifi.set_string("ssid", "home").unwrap();
        assert_eq!(other.get_string("ssid").unwrap(), None);
        assert_eq!(store.value("wifi", "ssid").as_deref(), Some("home"));
    }

    #[test]
    fn erasing_a_missing_key_is_not_found() {
        let store = MemoryStore::new();
        let mut session = store.open("wifi").unwrap();
        assert_eq!(session.erase_key("ssid"), Err(DriverError::NVS_NOT_FOUND));
    }

    #[test]
    fn overlong_names_are_rejected() {
        let store = MemoryStore::new();
        assert!(store.open("a_namespace_too_long").is_err());
        let mut session = store.open("wifi").unwrap();
        assert_eq!(
            session.set_string("a_key_that_is_too_long", "x"),
            Err(DriverError::INVALID_ARG)
        );
    }
}
