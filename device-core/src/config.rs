/// Configuration structures that can be tested independently
use core::fmt;
use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Who this device is. Set once at boot and never changed afterwards.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub tenant_id: String,
    pub device_id: String,
    /// Long-lived shared secret used to sign session credentials.
    pub device_key: String,
}

impl DeviceIdentity {
    pub fn new(
        tenant_id: impl Into<String>,
        device_id: impl Into<String>,
        device_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            device_key: device_key.into(),
        }
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("tenant_id", &self.tenant_id)
            .field("device_id", &self.device_id)
            .field(
                "device_key",
                &if self.device_key.is_empty() { "<empty>" } else { "<set>" },
            )
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub state_interval_ms: u64,
    pub stale_timeout_ms: u64,
    pub link_connect_timeout_ms: u64,
    pub session_connect_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Consecutive failed attempts before a diagnostics dump is logged.
    pub diagnostics_after_failures: u32,
    pub keep_alive_secs: u16,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 25_000,
            state_interval_ms: 60_000,
            stale_timeout_ms: 90_000,
            link_connect_timeout_ms: 20_000,
            session_connect_timeout_ms: 15_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            diagnostics_after_failures: 5,
            keep_alive_secs: 60,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn state_interval(&self) -> Duration {
        Duration::from_millis(self.state_interval_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn link_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.link_connect_timeout_ms)
    }

    pub fn session_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.session_connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub min_free_heap: u32,
    pub min_rssi_dbm: i8,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            min_free_heap: 10_000,
            min_rssi_dbm: -80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub stall_timeout_ms: u64,
    /// Time the freshly booted image has to reach the broker before rollback.
    pub grace_window_ms: u64,
    pub chunk_size: usize,
    pub chunks_per_tick: usize,
    pub progress_step_percent: u8,
    pub max_image_bytes: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_ms: 2_000,
            retry_max_ms: 30_000,
            stall_timeout_ms: 30_000,
            grace_window_ms: 120_000,
            chunk_size: 4096,
            chunks_per_tick: 4,
            progress_step_percent: 10,
            max_image_bytes: 4 * 1024 * 1024,
        }
    }
}

impl OtaConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    /// Pins the `relay` action may drive.
    pub relay_pins: Vec<u8>,
    pub max_pin: u8,
    pub pwm_max: u8,
    /// Recently acknowledged command ids to remember. 0 re-executes duplicates.
    pub dedupe_capacity: usize,
    pub pending_ack_capacity: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            relay_pins: vec![4, 2],
            max_pin: 39,
            pwm_max: 255,
            dedupe_capacity: 0,
            pending_ack_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenConfig {
    pub lifetime_secs: u64,
    pub refresh_margin_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            lifetime_secs: 3600,
            refresh_margin_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub timing: TimingConfig,
    pub health: HealthConfig,
    pub ota: OtaConfig,
    pub commands: CommandConfig,
    pub token: TokenConfig,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        let t = &self.timing;
        if t.heartbeat_interval_ms == 0 || t.state_interval_ms == 0 || t.stale_timeout_ms == 0 {
            return Err(CoreError::Config("timer intervals must be non-zero".into()));
        }
        if t.reconnect_base_ms == 0 || t.reconnect_base_ms > t.reconnect_max_ms {
            return Err(CoreError::Config(format!(
                "reconnect base {}ms must be non-zero and <= ceiling {}ms",
                t.reconnect_base_ms, t.reconnect_max_ms
            )));
        }
        if t.stale_timeout_ms <= t.heartbeat_interval_ms {
            return Err(CoreError::Config(
                "staleness threshold must exceed the heartbeat interval".into(),
            ));
        }
        if self.health.check_interval_ms == 0 {
            return Err(CoreError::Config("health check interval must be non-zero".into()));
        }
        let o = &self.ota;
        if o.progress_step_percent == 0 || o.progress_step_percent > 100 {
            return Err(CoreError::Config("ota progress step must be 1..=100".into()));
        }
        if o.chunk_size == 0 || o.chunks_per_tick == 0 {
            return Err(CoreError::Config("ota chunk settings must be non-zero".into()));
        }
        if o.retry_base_ms > o.retry_max_ms {
            return Err(CoreError::Config("ota retry base exceeds ceiling".into()));
        }
        if self.token.refresh_margin_secs >= self.token.lifetime_secs {
            return Err(CoreError::Config("token refresh margin must be below lifetime".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_config_serialization() {
        let config = CoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"timing":{"heartbeat_interval_ms":5000}}"#).unwrap();
        assert_eq!(config.timing.heartbeat_interval_ms, 5000);
        assert_eq!(config.timing.stale_timeout_ms, 90_000);
        assert_eq!(config.ota.max_retries, 3);
    }

    #[test]
    fn test_defaults_validate() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_stale_must_exceed_heartbeat() {
        let mut config = CoreConfig::default();
        config.timing.stale_timeout_ms = config.timing.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_base_above_ceiling_rejected() {
        let mut config = CoreConfig::default();
        config.timing.reconnect_base_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identity_debug_hides_key() {
        let identity = DeviceIdentity::new("tenantA", "pump-1", "ABC12345");
        let printed = format!("{identity:?}");
        assert!(printed.contains("pump-1"));
        assert!(!printed.contains("ABC12345"));
    }
}
