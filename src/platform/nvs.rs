use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use crate::error::DriverError;
use crate::storage::{KeyValueSession, KeyValueStore};

// NVS string values are capped well below this for credentials.
const MAX_VALUE_LEN: usize = 128;

/// NVS on the default partition.
pub struct EspKeyValueStore {
    partition: EspDefaultNvsPartition,
}

impl EspKeyValueStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self { partition }
    }
}

impl KeyValueStore for EspKeyValueStore {
    fn open(&self, namespace: &str) -> Result<Box<dyn KeyValueSession>, DriverError> {
        let nvs = EspNvs::new(self.partition.clone(), namespace, true)?;
        Ok(Box::new(EspSession { nvs }))
    }
}

struct EspSession {
    nvs: EspNvs<NvsDefault>,
}

impl KeyValueSession for EspSession {
    fn get_string(&mut self, key: &str) -> Result<Option<String>, DriverError> {
        let mut buf = [0u8; MAX_VALUE_LEN];
        Ok(self.nvs.get_str(key, &mut buf)?.map(str::to_string))
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), DriverError> {
        self.nvs.set_str(key, value)?;
        Ok(())
    }

    fn erase_key(&mut self, key: &str) -> Result<(), DriverError> {
        if self.nvs.remove(key)? {
            Ok(())
        } else {
            Err(DriverError::NVS_NOT_FOUND)
        }
    }

    // EspNvs commits after every write and erase.
    fn commit(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}
