//! Button-triggered ESPTouch WiFi provisioning for ESP32 stations.

pub mod app;
pub mod config;
pub mod error;
pub mod event;
pub mod gpio;
pub mod handle;
pub mod runtime;
pub mod singleton;
pub mod smartconfig;
pub mod storage;
pub mod sync;
pub mod task;
pub mod wifi;

#[cfg(target_os = "espidf")]
pub mod platform;

#[cfg(not(target_os = "espidf"))]
pub mod sim;
