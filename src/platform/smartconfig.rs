use core::ffi::c_char;

use esp_idf_svc::sys::{
    esp_smartconfig_get_rvd_data, esp_smartconfig_set_type, esp_smartconfig_start,
    esp_smartconfig_stop, smartconfig_start_config_t, smartconfig_type_t,
    smartconfig_type_t_SC_TYPE_AIRKISS, smartconfig_type_t_SC_TYPE_ESPTOUCH,
    smartconfig_type_t_SC_TYPE_ESPTOUCH_AIRKISS, smartconfig_type_t_SC_TYPE_ESPTOUCH_V2,
};

use crate::error::DriverError;
use crate::smartconfig::{SmartConfigKind, SmartConfigService, SmartConfigStart};

use super::check;

// Upper bound of the ESPTouch v2 reserved data.
const MAX_RESERVED_DATA: usize = 127;

/// `esp_smartconfig_*`.
pub struct EspSmartConfig;

fn raw_kind(kind: SmartConfigKind) -> smartconfig_type_t {
    match kind {
        SmartConfigKind::EspTouch => smartconfig_type_t_SC_TYPE_ESPTOUCH,
        SmartConfigKind::AirKiss => smartconfig_type_t_SC_TYPE_AIRKISS,
        SmartConfigKind::EspTouchAirKiss => smartconfig_type_t_SC_TYPE_ESPTOUCH_AIRKISS,
        SmartConfigKind::EspTouchV2 => smartconfig_type_t_SC_TYPE_ESPTOUCH_V2,
    }
}

impl SmartConfigService for EspSmartConfig {
    fn set_kind(&self, kind: SmartConfigKind) -> Result<(), DriverError> {
        check(unsafe { esp_smartconfig_set_type(raw_kind(kind)) })
    }

    fn start(&self, config: &SmartConfigStart) -> Result<(), DriverError> {
        // NUL terminated; only read during the start call.
        let mut key = [0u8; 17];
        let key_ptr = match config.esp_touch_v2_key {
            Some(k) => {
                key[..16].copy_from_slice(&k);
                key.as_mut_ptr() as *mut c_char
            }
            None => core::ptr::null_mut(),
        };

        let raw = smartconfig_start_config_t {
            enable_log: config.enable_log,
            esp_touch_v2_enable_crypt: config.esp_touch_v2_enable_crypt,
            esp_touch_v2_key: key_ptr,
        };
        check(unsafe { esp_smartconfig_start(&raw) })
    }

    fn stop(&self) -> Result<(), DriverError> {
        check(unsafe { esp_smartconfig_stop() })
    }

    fn extra_data(&self) -> Result<Vec<u8>, DriverError> {
        let mut buf = [0u8; MAX_RESERVED_DATA];
        check(unsafe { esp_smartconfig_get_rvd_data(buf.as_mut_ptr(), buf.len() as u8) })?;
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(buf[..len].to_vec())
    }
}
