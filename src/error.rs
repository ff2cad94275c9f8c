use std::fmt;

/// Platform status code returned by a collaborator (an `esp_err_t` on device).
///
/// The core never aborts on one of these by itself; callers decide whether a
/// rejected call is fatal (driver init), tolerable (already initialised) or
/// just logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverError {
    code: i32,
}

impl DriverError {
    pub const FAIL: Self = Self::from_code(-1);
    pub const NO_MEM: Self = Self::from_code(0x101);
    pub const INVALID_ARG: Self = Self::from_code(0x102);
    pub const INVALID_STATE: Self = Self::from_code(0x103);
    pub const INVALID_SIZE: Self = Self::from_code(0x104);
    pub const NOT_FOUND: Self = Self::from_code(0x105);
    pub const NOT_SUPPORTED: Self = Self::from_code(0x106);
    pub const TIMEOUT: Self = Self::from_code(0x107);
    pub const NVS_NOT_INITIALIZED: Self = Self::from_code(0x1101);
    pub const NVS_NOT_FOUND: Self = Self::from_code(0x1102);
    pub const WIFI_NOT_INIT: Self = Self::from_code(0x3001);
    pub const WIFI_NOT_STARTED: Self = Self::from_code(0x3002);
    pub const WIFI_NOT_STOPPED: Self = Self::from_code(0x3003);
    pub const WIFI_CONN: Self = Self::from_code(0x3007);
    pub const WIFI_SSID: Self = Self::from_code(0x3008);
    pub const WIFI_PASSWORD: Self = Self::from_code(0x300A);

    pub const fn from_code(code: i32) -> Self {
        Self { code }
    }

    pub const fn code(&self) -> i32 {
        self.code
    }

    /// `ESP_ERR_INVALID_STATE` is how ESP-IDF reports "already initialised".
    pub fn is_invalid_state(&self) -> bool {
        *self == Self::INVALID_STATE
    }

    /// The ESP-IDF name of this code; on device `esp_err_to_name` supplies it.
    #[cfg(not(target_os = "espidf"))]
    pub fn name(&self) -> &'static str {
        match *self {
            Self::FAIL => "ESP_FAIL",
            Self::NO_MEM => "ESP_ERR_NO_MEM",
            Self::INVALID_ARG => "ESP_ERR_INVALID_ARG",
            Self::INVALID_STATE => "ESP_ERR_INVALID_STATE",
            Self::INVALID_SIZE => "ESP_ERR_INVALID_SIZE",
            Self::NOT_FOUND => "ESP_ERR_NOT_FOUND",
            Self::NOT_SUPPORTED => "ESP_ERR_NOT_SUPPORTED",
            Self::TIMEOUT => "ESP_ERR_TIMEOUT",
            Self::NVS_NOT_INITIALIZED => "ESP_ERR_NVS_NOT_INITIALIZED",
            Self::NVS_NOT_FOUND => "ESP_ERR_NVS_NOT_FOUND",
            Self::WIFI_NOT_INIT => "ESP_ERR_WIFI_NOT_INIT",
            Self::WIFI_NOT_STARTED => "ESP_ERR_WIFI_NOT_STARTED",
            Self::WIFI_NOT_STOPPED => "ESP_ERR_WIFI_NOT_STOPPED",
            Self::WIFI_CONN => "ESP_ERR_WIFI_CONN",
            Self::WIFI_SSID => "ESP_ERR_WIFI_SSID",
            Self::WIFI_PASSWORD => "ESP_ERR_WIFI_PASSWORD",
            _ => "UNKNOWN ERROR",
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.code)
    }
}

#[cfg(target_os = "espidf")]
impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match esp_idf_svc::sys::EspError::from(self.code) {
            Some(e) => write!(f, "{} (0x{:x})", e, self.code),
            None => f.write_str("ESP_OK"),
        }
    }
}

impl std::error::Error for DriverError {}

#[cfg(target_os = "espidf")]
impl From<esp_idf_svc::sys::EspError> for DriverError {
    fn from(e: esp_idf_svc::sys::EspError) -> Self {
        Self::from_code(e.code())
    }
}

/// Treat "already initialised" as success; every other rejection passes through.
pub fn tolerate_invalid_state(result: Result<(), DriverError>) -> Result<(), DriverError> {
    match result {
        Err(e) if e.is_invalid_state() => Ok(()),
        other => other,
    }
}

/// Outcome of dispatching one event to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Ok,
    /// The id is not one this handler knows; logged at warning level, not an error.
    Unhandled,
    /// The handler ran but the operation it attempted was rejected.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(target_os = "espidf"))]
    fn names_known_codes() {
        assert_eq!(DriverError::INVALID_STATE.name(), "ESP_ERR_INVALID_STATE");
        assert_eq!(DriverError::from_code(0x7777).name(), "UNKNOWN ERROR");
        assert_eq!(
            DriverError::WIFI_CONN.to_string(),
            "ESP_ERR_WIFI_CONN (0x3007)"
        );
    }

    #[test]
    fn invalid_state_is_tolerated() {
        assert_eq!(tolerate_invalid_state(Err(DriverError::INVALID_STATE)), Ok(()));
        assert_eq!(
            tolerate_invalid_state(Err(DriverError::NO_MEM)),
            Err(DriverError::NO_MEM)
        );
    }
}
