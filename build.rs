use std::fs;
use std::path::Path;

const CONFIG_HEADER: &str = "device_config.h";

/// Compiled-in defaults, used until NVS holds a configuration.
const DEFINES: &[(&str, &str)] = &[
    ("WIFI_SSID", ""),
    ("WIFI_PASSWORD", ""),
    ("MQTT_HOST", ""),
    ("MQTT_PORT", "8883"),
    ("TENANT_ID", ""),
    ("DEVICE_ID", ""),
    ("DEVICE_KEY", ""),
];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF. Host builds (cargo test) skip it.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    println!("cargo:rerun-if-changed={}", CONFIG_HEADER);

    let contents = if Path::new(CONFIG_HEADER).exists() {
        fs::read_to_string(CONFIG_HEADER)?
    } else {
        println!(
            "cargo:warning={} not found! Copy {}.example to {} and fill in your device credentials.",
            CONFIG_HEADER, CONFIG_HEADER, CONFIG_HEADER
        );
        String::new()
    };

    for (name, fallback) in DEFINES {
        let value = parse_define(&contents, name).unwrap_or_else(|| fallback.to_string());
        println!("cargo:rustc-env={}={}", name, value);
    }

    Ok(())
}

/// `#define NAME "value"` or `#define NAME 1234`
fn parse_define(contents: &str, name: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        if parts.next()? != "#define" || parts.next()? != name {
            return None;
        }
        let raw = parts.next()?.trim();
        match raw.split('"').nth(1) {
            Some(quoted) => Some(quoted.to_string()),
            None => Some(raw.to_string()),
        }
    })
}
