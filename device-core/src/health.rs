use core::time::Duration;

use serde::Serialize;
use strum::Display;

use crate::config::HealthConfig;

/// Memory and radio readings supplied by the board.
pub trait SystemProbe {
    fn free_heap(&self) -> u32;
    /// `None` while not associated.
    fn rssi_dbm(&self) -> Option<i8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum HealthIssue {
    LinkDown,
    SessionDown,
    LowMemory,
    WeakSignal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Seconds since boot at the last evaluation.
    pub uptime: u64,
    pub signal_strength: Option<i8>,
    pub free_memory: u32,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            is_healthy: true,
            error_count: 0,
            last_error: None,
            uptime: 0,
            signal_strength: None,
            free_memory: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEdge {
    BecameUnhealthy,
    Recovered,
}

/// Connectivity facts sampled from the supervisor at evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct LinkStatus {
    pub link_up: bool,
    pub session_up: bool,
}

pub struct HealthMonitor {
    config: HealthConfig,
    snapshot: HealthSnapshot,
    last_check: Duration,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            snapshot: HealthSnapshot::default(),
            last_check: Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> &HealthSnapshot {
        &self.snapshot
    }

    pub fn is_healthy(&self) -> bool {
        self.snapshot.is_healthy
    }

    /// Evaluate if the check interval has elapsed.
    pub fn tick(
        &mut self,
        now: Duration,
        status: LinkStatus,
        probe: &impl SystemProbe,
    ) -> Option<HealthEdge> {
        if now.saturating_sub(self.last_check) < Duration::from_millis(self.config.check_interval_ms) {
            return None;
        }
        self.evaluate(now, status, probe)
    }

    pub fn evaluate(
        &mut self,
        now: Duration,
        status: LinkStatus,
        probe: &impl SystemProbe,
    ) -> Option<HealthEdge> {
        self.last_check = now;
        let free_heap = probe.free_heap();
        let rssi = probe.rssi_dbm();

        let mut issues = Vec::with_capacity(4);
        if !status.link_up {
            issues.push(HealthIssue::LinkDown);
        }
        if !status.session_up {
            issues.push(HealthIssue::SessionDown);
        }
        if free_heap < self.config.min_free_heap {
            issues.push(HealthIssue::LowMemory);
        }
        if rssi.is_some_and(|r| r < self.config.min_rssi_dbm) {
            issues.push(HealthIssue::WeakSignal);
        }

        let was_healthy = self.snapshot.is_healthy;
        self.snapshot.uptime = now.as_secs();
        self.snapshot.free_memory = free_heap;
        self.snapshot.signal_strength = rssi;

        if let Some(last) = issues.last() {
            for issue in &issues {
                log::warn!("Health issue: {}", issue);
            }
            self.snapshot.is_healthy = false;
            self.snapshot.error_count = self.snapshot.error_count.saturating_add(issues.len() as u32);
            self.snapshot.last_error = Some(last.to_string());
        } else {
            self.snapshot.is_healthy = true;
            self.snapshot.error_count = 0;
            self.snapshot.last_error = None;
        }

        match (was_healthy, self.snapshot.is_healthy) {
            (true, false) => {
                log::warn!("Device became unhealthy ({} errors)", self.snapshot.error_count);
                Some(HealthEdge::BecameUnhealthy)
            }
            (false, true) => {
                log::info!("Device health recovered");
                Some(HealthEdge::Recovered)
            }
            _ => None,
        }
    }
}
