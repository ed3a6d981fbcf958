// ESP-IDF implementations of the device-core collaborator traits

pub mod board;
pub mod flash;
pub mod http;
pub mod net;

use device_core::RebootReason;

/// Get the last reset reason as a string
pub fn reset_reason() -> &'static str {
    let reason = unsafe { esp_idf_sys::esp_reset_reason() };

    match reason {
        esp_idf_sys::esp_reset_reason_t_ESP_RST_UNKNOWN => "Unknown",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => "Power-on",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => "External pin",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => "Software reset",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => "Panic",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => "Interrupt watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "Task watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => "Other watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "Deep sleep",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "Brownout",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SDIO => "SDIO",
        _ => "Unknown reason code",
    }
}

/// Arm the task watchdog for the calling task.
pub fn init_watchdog(timeout_ms: u32) {
    unsafe {
        let _ = esp_idf_sys::esp_task_wdt_deinit();
        let wdt_config = esp_idf_sys::esp_task_wdt_config_t {
            timeout_ms,
            idle_core_mask: 0,
            trigger_panic: true,
        };
        if esp_idf_sys::esp_task_wdt_init(&wdt_config) != esp_idf_sys::ESP_OK {
            log::warn!("Failed to configure task watchdog");
            return;
        }
        if esp_idf_sys::esp_task_wdt_add(std::ptr::null_mut()) == esp_idf_sys::ESP_OK {
            log::info!("Watchdog timeout set to {} ms", timeout_ms);
        } else {
            log::warn!("Failed to add main task to watchdog");
        }
    }
}

pub fn feed_watchdog() {
    unsafe {
        esp_idf_sys::esp_task_wdt_reset();
    }
}

/// Give the MQTT outbox a moment to drain, then restart.
pub fn restart(reason: RebootReason) -> ! {
    log::warn!("Restarting: {:?}", reason);
    log::logger().flush();
    esp_idf_hal::delay::FreeRtos::delay_ms(1000);

    match reason {
        RebootReason::OtaRolledBack => flash::restart_rolling_back(),
        RebootReason::Command | RebootReason::OtaApplied => unsafe { esp_idf_sys::esp_restart() },
    }
}
