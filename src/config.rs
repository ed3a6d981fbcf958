use anyhow::Result;
use core::fmt;
use device_core::config::CommandConfig;
use device_core::{CoreConfig, DeviceIdentity};
use serde::{Deserialize, Serialize};

use crate::logging::redact;

#[cfg(target_os = "espidf")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

const CONFIG_NAMESPACE: &str = "saphari";
const CONFIG_KEY: &str = "config";
const MAX_CONFIG_BYTES: usize = 4096;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    // WiFi settings
    pub wifi_ssid: String,
    pub wifi_password: String,

    // Broker
    pub mqtt_host: String,
    pub mqtt_port: u16,

    pub identity: DeviceIdentity,
    pub log_level: String,
    /// GPIO driving the link indicator LED
    pub status_led_pin: u8,

    pub core: CoreConfig,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        // Set by build.rs from device_config.h, which is never committed
        Self {
            wifi_ssid: env!("WIFI_SSID").to_string(),
            wifi_password: env!("WIFI_PASSWORD").to_string(),
            mqtt_host: env!("MQTT_HOST").to_string(),
            mqtt_port: env!("MQTT_PORT").parse().unwrap_or(8883),
            identity: DeviceIdentity::new(env!("TENANT_ID"), env!("DEVICE_ID"), env!("DEVICE_KEY")),
            log_level: "info".to_string(),
            status_led_pin: 48,
            core: CoreConfig {
                // ESP32-S3 GPIO range
                commands: CommandConfig {
                    max_pin: 48,
                    ..CommandConfig::default()
                },
                ..CoreConfig::default()
            },
        }
    }
}

impl fmt::Debug for FirmwareConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareConfig")
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_password", &redact(&self.wifi_password))
            .field("mqtt_host", &self.mqtt_host)
            .field("mqtt_port", &self.mqtt_port)
            .field("identity", &self.identity)
            .field("log_level", &self.log_level)
            .field("status_led_pin", &self.status_led_pin)
            .finish_non_exhaustive()
    }
}

impl FirmwareConfig {
    pub fn broker_url(&self) -> String {
        format!("mqtts://{}:{}", self.mqtt_host, self.mqtt_port)
    }

    /// Replace empty credentials and identity fields with the compiled-in
    /// ones. Returns true if anything changed.
    pub fn fill_missing(&mut self, defaults: &FirmwareConfig) -> bool {
        let mut changed = false;
        if self.wifi_ssid.is_empty() || self.wifi_password.is_empty() {
            log::warn!(
                "Stored WiFi credentials empty, using compiled defaults: SSID='{}'",
                defaults.wifi_ssid
            );
            self.wifi_ssid = defaults.wifi_ssid.clone();
            self.wifi_password = defaults.wifi_password.clone();
            changed = true;
        }
        if self.mqtt_host.is_empty() {
            self.mqtt_host = defaults.mqtt_host.clone();
            self.mqtt_port = defaults.mqtt_port;
            changed = true;
        }
        let id = &mut self.identity;
        for (field, fallback) in [
            (&mut id.tenant_id, &defaults.identity.tenant_id),
            (&mut id.device_id, &defaults.identity.device_id),
            (&mut id.device_key, &defaults.identity.device_key),
        ] {
            if field.is_empty() && !fallback.is_empty() {
                *field = fallback.clone();
                changed = true;
            }
        }
        changed
    }

    /// Anything the device cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.wifi_ssid.is_empty() {
            anyhow::bail!("no WiFi SSID configured");
        }
        if self.mqtt_host.is_empty() {
            anyhow::bail!("no broker host configured");
        }
        let id = &self.identity;
        if id.tenant_id.is_empty() || id.device_id.is_empty() || id.device_key.is_empty() {
            anyhow::bail!("device identity incomplete: {:?}", id);
        }
        self.core.validate()?;
        Ok(())
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(target_os = "espidf")]
impl FirmwareConfig {
    pub fn save(&self, partition: &EspDefaultNvsPartition) -> Result<()> {
        save_to_nvs(self, partition)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
pub fn load_or_default(partition: &EspDefaultNvsPartition) -> Result<FirmwareConfig> {
    let defaults = FirmwareConfig::default();
    match load_from_nvs(partition) {
        Ok(mut config) => {
            log::info!("Loaded configuration from NVS");
            if config.fill_missing(&defaults) {
                if let Err(e) = config.save(partition) {
                    log::warn!("Failed to save config with compiled defaults: {:?}", e);
                }
            }
            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            if let Err(save_err) = defaults.save(partition) {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }
            Ok(defaults)
        }
    }
}

#[cfg(target_os = "espidf")]
fn load_from_nvs(partition: &EspDefaultNvsPartition) -> Result<FirmwareConfig> {
    let nvs = EspNvs::new(partition.clone(), CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; MAX_CONFIG_BYTES];
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

    FirmwareConfig::from_json(data)
}

#[cfg(target_os = "espidf")]
fn save_to_nvs(config: &FirmwareConfig, partition: &EspDefaultNvsPartition) -> Result<()> {
    let mut nvs = EspNvs::new(partition.clone(), CONFIG_NAMESPACE, true)?;

    let json = serde_json::to_vec(config)?;
    if json.len() > MAX_CONFIG_BYTES {
        anyhow::bail!("config is {} bytes, NVS slot holds {}", json.len(), MAX_CONFIG_BYTES);
    }
    nvs.set_blob(CONFIG_KEY, &json)?;

    Ok(())
}
