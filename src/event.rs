//! Platform event bus seam.
//!
//! The driver stacks post events identified by a base and a numeric id. The
//! ids below are the ESP-IDF values so that the device backend can pass
//! them through unchanged.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::warn;

use crate::error::DriverError;
use crate::handle::Handle;
use crate::smartconfig::SmartConfigKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventBase {
    Wifi,
    Ip,
    SmartConfig,
}

impl fmt::Display for EventBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Wifi => "WIFI_EVENT",
            Self::Ip => "IP_EVENT",
            Self::SmartConfig => "SC_EVENT",
        })
    }
}

/// Register for every id of a base.
pub const ANY_ID: i32 = -1;

pub mod wifi_event {
    pub const STA_START: i32 = 2;
    pub const STA_STOP: i32 = 3;
    pub const STA_CONNECTED: i32 = 4;
    pub const STA_DISCONNECTED: i32 = 5;
}

pub mod ip_event {
    pub const STA_GOT_IP: i32 = 0;
}

pub mod sc_event {
    pub const SCAN_DONE: i32 = 0;
    pub const FOUND_CHANNEL: i32 = 1;
    pub const GOT_SSID_PSWD: i32 = 2;
    pub const SEND_ACK_DONE: i32 = 3;
}

/// Credentials delivered by the provisioning phone app, in the vendor layout:
/// fixed, NUL-padded buffers that are not guaranteed to be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorCredentials {
    pub ssid: [u8; 32],
    pub password: [u8; 64],
    pub bssid_set: bool,
    pub bssid: [u8; 6],
    pub kind: SmartConfigKind,
    pub token: u8,
    pub cellphone_ip: [u8; 4],
}

impl VendorCredentials {
    /// Build from byte strings, truncating anything past the vendor buffer sizes.
    pub fn new(ssid: &[u8], password: &[u8], kind: SmartConfigKind) -> Self {
        let mut creds = Self {
            ssid: [0; 32],
            password: [0; 64],
            bssid_set: false,
            bssid: [0; 6],
            kind,
            token: 0,
            cellphone_ip: [0; 4],
        };
        copy_clamped(&mut creds.ssid, ssid);
        copy_clamped(&mut creds.password, password);
        creds
    }

    pub fn with_bssid(mut self, bssid: [u8; 6]) -> Self {
        self.bssid_set = true;
        self.bssid = bssid;
        self
    }
}

/// Copy as much of `src` as fits into `dst`; the remainder of `dst` is zeroed.
pub(crate) fn copy_clamped(dst: &mut [u8], src: &[u8]) {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
    dst[len..].fill(0);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    None,
    GotSsidPassword(VendorCredentials),
    Disconnected { reason: u8 },
    GotIp { ip: Ipv4Addr },
}

pub type EventHandler = Arc<dyn Fn(EventBase, i32, &EventData) + Send + Sync>;

/// Identifies one registration on an [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub usize);

pub trait EventBus: Send + Sync {
    /// Create the default event loop. `INVALID_STATE` means it already exists.
    fn create_default_loop(&self) -> Result<(), DriverError>;

    /// Register `handler` for `id` on `base`, or every id with [`ANY_ID`].
    fn register(
        &self,
        base: EventBase,
        id: i32,
        handler: EventHandler,
    ) -> Result<HandlerId, DriverError>;

    fn unregister(&self, base: EventBase, id: i32, handler: HandlerId) -> Result<(), DriverError>;
}

/// A registration that is removed from its bus when dropped.
pub type Subscription = Handle<HandlerId>;

pub fn subscribe(
    bus: &Arc<dyn EventBus>,
    base: EventBase,
    id: i32,
    handler: EventHandler,
) -> Result<Subscription, DriverError> {
    let registered = bus.register(base, id, handler)?;
    let bus = bus.clone();

    Ok(Handle::new(registered, move |registered| {
        if let Err(e) = bus.unregister(base, id, registered) {
            warn!("Failed to unregister {} handler: {}", base, e);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_credentials_are_clamped_and_padded() {
        let long = [b'x'; 40];
        let creds = VendorCredentials::new(&long, b"pw", SmartConfigKind::EspTouch);
        assert_eq!(creds.ssid, [b'x'; 32]);
        assert_eq!(&creds.password[..3], b"pw\0");
        assert!(!creds.bssid_set);

        let with = creds.with_bssid([1, 2, 3, 4, 5, 6]);
        assert!(with.bssid_set);
        assert_eq!(with.bssid, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn copy_clamped_zeroes_the_tail() {
        let mut dst = [0xffu8; 6];
        copy_clamped(&mut dst, b"abc");
        assert_eq!(&dst, b"abc\0\0\0");
    }
}
