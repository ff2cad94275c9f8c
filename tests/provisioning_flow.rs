#![cfg(not(target_os = "espidf"))]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use touchprov::app::{App, Dispatch};
use touchprov::config::AppConfig;
use touchprov::gpio::PinId;
use touchprov::sim::{SimServices, WifiCall};
use touchprov::smartconfig::{ProvisioningSession, SmartConfigState};
use touchprov::sync::Timeout;
use touchprov::wifi::{NetworkManager, WifiOptions, WifiState};

const BUTTON: PinId = PinId(34);
const POLL: Timeout = Timeout::from_millis(1000);

fn config(keep_wifi_alive: bool) -> AppConfig {
    AppConfig {
        keep_wifi_alive,
        wifi: WifiOptions {
            clear_credentials_on_construction: false,
        },
        ..AppConfig::default()
    }
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn press_provision_and_persist() {
    let sim = SimServices::new();
    sim.wifi.add_access_point("home", "hunter22");
    let rt = sim.runtime();
    let mut app = App::new(rt.clone(), &sim.registry(), config(false)).unwrap();

    sim.gpio.trigger(BUTTON);
    assert_eq!(app.poll(POLL).unwrap(), Dispatch::Held(1));
    assert!(sim.smartconfig.is_running());

    let session = ProvisioningSession::get_weak(&rt).upgrade().unwrap();
    assert!(sim.smartconfig.deliver("home", "hunter22"));
    sim.events.flush();
    assert_eq!(session.state(), SmartConfigState::Connected);

    assert!(sim.smartconfig.acknowledge());
    sim.events.flush();
    assert!(wait_for(|| session.state() == SmartConfigState::Done));
    assert!(!sim.smartconfig.is_running());

    assert_eq!(sim.storage.value("wifi", "ssid").as_deref(), Some("home"));
    assert_eq!(sim.storage.value("wifi", "password").as_deref(), Some("hunter22"));
    assert!(wait_for(|| session.wifi().state() == WifiState::Done));
}

#[test]
fn stored_credentials_reconnect_on_boot_with_keep_alive() {
    let sim = SimServices::new();
    sim.storage.seed("wifi", "ssid", "home");
    sim.storage.seed("wifi", "password", "hunter22");
    sim.wifi.add_access_point("home", "hunter22");
    let rt = sim.runtime();

    let _app = App::new(rt.clone(), &sim.registry(), config(true)).unwrap();
    sim.events.flush();
    sim.events.flush();

    assert!(sim.wifi.is_connected());
    let wifi = NetworkManager::get_weak(&rt).upgrade().unwrap();
    assert!(wait_for(|| wifi.state() == WifiState::Done));
    assert!(ProvisioningSession::get_weak(&rt).upgrade().is_none());
}

#[test]
fn sixth_press_wipes_and_releases_everything() {
    let sim = SimServices::new();
    sim.storage.seed("wifi", "ssid", "home");
    sim.storage.seed("wifi", "password", "hunter22");
    let rt = sim.runtime();
    let mut app = App::new(rt.clone(), &sim.registry(), config(false)).unwrap();

    for _ in 0..5 {
        sim.gpio.trigger(BUTTON);
        app.poll(POLL).unwrap();
    }
    sim.events.flush();
    let first = ProvisioningSession::get_weak(&rt).upgrade().unwrap();
    // Every press shares the one live session.
    assert_eq!(Arc::strong_count(&first), 6);
    drop(first);

    sim.gpio.trigger(BUTTON);
    assert_eq!(app.poll(POLL).unwrap(), Dispatch::Wiped);
    sim.events.flush();

    assert!(ProvisioningSession::get_weak(&rt).upgrade().is_none());
    assert!(NetworkManager::get_weak(&rt).upgrade().is_none());
    assert!(!sim.smartconfig.is_running());
    assert_eq!(sim.storage.value("wifi", "ssid"), None);
    assert!(sim.wifi.calls().ends_with(&[
        WifiCall::Disconnect,
        WifiCall::Stop,
        WifiCall::Deinit,
        WifiCall::ClearDefaultHandlers,
        WifiCall::DestroyNetif,
    ]));

    // The next press starts over with a fresh session.
    sim.gpio.trigger(BUTTON);
    assert_eq!(app.poll(POLL).unwrap(), Dispatch::Held(1));
    assert!(sim.smartconfig.is_running());
}

#[test]
fn presses_beyond_queue_capacity_are_counted() {
    let sim = SimServices::new();
    let app = App::new(sim.runtime(), &sim.registry(), config(false)).unwrap();

    for _ in 0..20 {
        sim.gpio.trigger(BUTTON);
    }
    assert_eq!(app.dropped_events(), 4);
}
