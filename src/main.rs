use anyhow::Result;

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use anyhow::Context;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use touchprov::app::App;
    use touchprov::config::{AppConfig, APP_TASK};
    use touchprov::platform;
    use touchprov::task::Task;

    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("🚀 Starting WiFi provisioning");

    let config = AppConfig::from_build_env()?;

    // Take the peripherals, the system event loop and the default NVS partition
    let peripherals = Peripherals::take().context("Failed to take peripherals")?;
    let sys_loop = EspSystemEventLoop::take().context("Failed to take the system event loop")?;
    let nvs = EspDefaultNvsPartition::take().context("Failed to initialise NVS")?;
    let (runtime, registry) = platform::take(peripherals.modem, sys_loop, nvs);

    // The app task owns the trigger button and every provisioning session

    let mut app_task = Task::spawn(&APP_TASK, move || {
        let result = App::new(runtime, &registry, config).and_then(App::run);
        if let Err(e) = result {
            log::error!("❌ Provisioning stopped: {:#}", e);
        }
    })?;

    app_task.join();
    Ok(())
}

/// Host run on the simulated board: one press, a phone delivering
/// credentials, then enough presses to wipe them again.
#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use std::time::{Duration, Instant};

    use anyhow::anyhow;
    use touchprov::app::App;
    use touchprov::config::AppConfig;
    use touchprov::sim::SimServices;
    use touchprov::smartconfig::{ProvisioningSession, SmartConfigState};
    use touchprov::sync::Timeout;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let sim = SimServices::new();
    sim.wifi.add_access_point("home", "hunter22");

    let config = AppConfig::from_build_env()?;
    let trigger = config.trigger_pin;
    let mut app = App::new(sim.runtime(), &sim.registry(), config)?;

    sim.gpio.trigger(trigger);
    app.poll(Timeout::from_millis(1000))?;

    let session = ProvisioningSession::get_weak(&sim.runtime())
        .upgrade()
        .ok_or_else(|| anyhow!("No provisioning session after the button press"))?;

    sim.smartconfig.deliver("home", "hunter22");
    sim.events.flush();
    sim.smartconfig.acknowledge();
    sim.events.flush();

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != SmartConfigState::Done && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    log::info!(
        "Provisioning {:?}, stored SSID '{}'",
        session.state(),
        session.wifi().stored_ssid()
    );
    drop(session);

    while app.held_sessions() > 0 {
        sim.gpio.trigger(trigger);
        app.poll(Timeout::from_millis(1000))?;
    }
    log::info!(
        "Credentials after wipe: {:?}",
        sim.storage.value("wifi", "ssid")
    );

    Ok(())
}
