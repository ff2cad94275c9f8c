use core::ffi::c_void;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use esp_idf_svc::sys::{
    esp_event_base_t, esp_event_handler_instance_register, esp_event_handler_instance_t,
    esp_event_handler_instance_unregister, esp_event_loop_create_default,
    ip_event_got_ip_t, smartconfig_event_got_ssid_pswd_t, smartconfig_type_t_SC_TYPE_AIRKISS,
    smartconfig_type_t_SC_TYPE_ESPTOUCH_AIRKISS, smartconfig_type_t_SC_TYPE_ESPTOUCH_V2,
    wifi_event_sta_disconnected_t, IP_EVENT, SC_EVENT, WIFI_EVENT,
};
use log::warn;

use crate::error::DriverError;
use crate::event::{
    ip_event, sc_event, wifi_event, EventBase, EventBus, EventData, EventHandler, HandlerId,
    VendorCredentials,
};
use crate::smartconfig::SmartConfigKind;

use super::check;

fn raw_base(base: EventBase) -> esp_event_base_t {
    unsafe {
        match base {
            EventBase::Wifi => WIFI_EVENT,
            EventBase::Ip => IP_EVENT,
            EventBase::SmartConfig => SC_EVENT,
        }
    }
}

// Context pointer handed to the C side for one registration.
struct Registration {
    base: EventBase,
    handler: EventHandler,
}

struct Registered {
    instance: esp_event_handler_instance_t,
    context: *mut Registration,
}

// Both pointers are owned by this registration and only touched under the map lock.
unsafe impl Send for Registered {}

/// Handlers on the ESP-IDF default event loop.
pub struct EspEventBus {
    registered: Mutex<HashMap<HandlerId, Registered>>,
    next_id: AtomicUsize,
}

impl EspEventBus {
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl Default for EspEventBus {
    fn default() -> Self {
        Self::new()
    }
}

unsafe extern "C" fn trampoline(
    context: *mut c_void,
    _base: esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    let registration = &*(context as *const Registration);
    // Cloned so that a handler unregistering itself keeps its closure alive.
    let handler = registration.handler.clone();
    let base = registration.base;

    let data = decode(base, id, data);
    handler(base, id, &data);
}

unsafe fn decode(base: EventBase, id: i32, data: *mut c_void) -> EventData {
    if data.is_null() {
        return EventData::None;
    }

    match (base, id) {
        (EventBase::Wifi, wifi_event::STA_DISCONNECTED) => {
            let event = &*(data as *const wifi_event_sta_disconnected_t);
            EventData::Disconnected {
                reason: event.reason as u8,
            }
        }
        (EventBase::Ip, ip_event::STA_GOT_IP) => {
            let event = &*(data as *const ip_event_got_ip_t);
            EventData::GotIp {
                ip: Ipv4Addr::from(event.ip_info.ip.addr.to_le_bytes()),
            }
        }
        (EventBase::SmartConfig, sc_event::GOT_SSID_PSWD) => {
            let event = &*(data as *const smartconfig_event_got_ssid_pswd_t);
            #[allow(non_upper_case_globals)]
            let kind = match event.type_ {
                smartconfig_type_t_SC_TYPE_AIRKISS => SmartConfigKind::AirKiss,
                smartconfig_type_t_SC_TYPE_ESPTOUCH_AIRKISS => SmartConfigKind::EspTouchAirKiss,
                smartconfig_type_t_SC_TYPE_ESPTOUCH_V2 => SmartConfigKind::EspTouchV2,
                _ => SmartConfigKind::EspTouch,
            };

            let mut creds = VendorCredentials::new(&event.ssid, &event.password, kind);
            if event.bssid_set {
                creds = creds.with_bssid(event.bssid);
            }
            creds.token = event.token;
            creds.cellphone_ip = event.cellphone_ip;
            EventData::GotSsidPassword(creds)
        }
        _ => EventData::None,
    }
}

impl EventBus for EspEventBus {
    fn create_default_loop(&self) -> Result<(), DriverError> {
        check(unsafe { esp_event_loop_create_default() })
    }

    fn register(
        &self,
        base: EventBase,
        event_id: i32,
        handler: EventHandler,
    ) -> Result<HandlerId, DriverError> {
        let context = Box::into_raw(Box::new(Registration { base, handler }));
        let mut instance: esp_event_handler_instance_t = core::ptr::null_mut();

        let result = check(unsafe {
            esp_event_handler_instance_register(
                raw_base(base),
                event_id,
                Some(trampoline),
                context as *mut c_void,
                &mut instance,
            )
        });
        if let Err(e) = result {
            drop(unsafe { Box::from_raw(context) });
            return Err(e);
        }

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Registered { instance, context });
        Ok(id)
    }

    fn unregister(&self, base: EventBase, event_id: i32, handler: HandlerId) -> Result<(), DriverError> {
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = registered.remove(&handler) else {
            return Err(DriverError::NOT_FOUND);
        };

        let result = check(unsafe {
            esp_event_handler_instance_unregister(raw_base(base), event_id, entry.instance)
        });
        match result {
            Ok(()) => drop(unsafe { Box::from_raw(entry.context) }),
            Err(e) => {
                // Still registered, so the context has to outlive this call.
                warn!("Handler {:?} is still registered: {}", handler, e);
                registered.insert(handler, entry);
                return Err(e);
            }
        }
        Ok(())
    }
}
