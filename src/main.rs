#![cfg_attr(not(target_os = "espidf"), allow(dead_code))]

mod config;
mod logging;
mod version;

#[cfg(target_os = "espidf")]
mod platform;

#[cfg(target_os = "espidf")]
use esp_idf_sys as _; // Binstart

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

/// One pass of the device loop every TICK_MS
const TICK_MS: u32 = 50;
const WATCHDOG_TIMEOUT_MS: u32 = 30_000;
/// Upper bound on one blocking read of the image download
const HTTP_TIMEOUT_SECS: u64 = 10;

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    use device_core::DeviceRuntime;
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::prelude::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::sntp::{EspSntp, SyncStatus};
    use log::info;

    use crate::platform::board::{EspBoard, StatusLed};
    use crate::platform::flash::EspFirmwareStore;
    use crate::platform::http::HttpsImageSource;
    use crate::platform::net::WifiMqttTransport;

    esp_idf_svc::sys::link_patches();
    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    let boot = Instant::now();
    let firmware_version = version::reported_version(
        version::running_elf_sha256().as_ref().map(|h| h.as_slice()),
    );
    info!("SapHari firmware {}", firmware_version);
    info!("Boot reason: {}", platform::reset_reason());
    info!("Free heap: {} bytes", unsafe { esp_idf_sys::esp_get_free_heap_size() });

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let config = config::load_or_default(&nvs)?;
    if !logging::set_max_level_from_str(&config.log_level) {
        log::warn!("Unknown log level '{}', keeping debug", config.log_level);
    }
    info!("Config: {:?}", config);
    config.validate()?;

    let transport = WifiMqttTransport::new(peripherals.modem, sys_loop, nvs.clone(), &config)?;
    let store = EspFirmwareStore::new(nvs)?;
    let source = HttpsImageSource::new(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS));
    let mut led = StatusLed::new(config.status_led_pin)?;

    let mut runtime = DeviceRuntime::new(
        config.identity.clone(),
        config.core.clone(),
        transport,
        store,
        source,
        EspBoard::new(),
        boot.elapsed(),
    )?;
    runtime.set_firmware_version(firmware_version);
    info!("OTA state at boot: {}", runtime.ota().state());

    let sntp = EspSntp::new_default()?;
    let mut clock_synced = false;

    platform::init_watchdog(WATCHDOG_TIMEOUT_MS);

    loop {
        let now = boot.elapsed();

        if !clock_synced && sntp.get_sync_status() == SyncStatus::Completed {
            if let Ok(wall) = SystemTime::now().duration_since(UNIX_EPOCH) {
                info!("Wall clock synced: {}", wall.as_secs());
                runtime.sync_wall_clock(now, wall.as_secs());
                clock_synced = true;
            }
        }

        let outcome = runtime.tick(now);
        led.set(runtime.supervisor().is_connected());
        platform::feed_watchdog();

        if let Some(reason) = outcome.reboot {
            platform::restart(reason);
        }

        FreeRtos::delay_ms(TICK_MS);
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    let _ = logging::init_logger();
    log::info!("SapHari firmware {}", version::reported_version(None));
    log::error!("This binary only runs on ESP-IDF targets; use `cargo test -p device-core` on the host");
}
