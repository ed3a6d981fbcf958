//! Heartbeats, retained state snapshots and health-driven presence updates.

use core::time::Duration;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::command::IoCapabilities;
use crate::config::{DeviceIdentity, TimingConfig};
use crate::health::{HealthEdge, HealthSnapshot, SystemProbe};
use crate::ota::OtaState;
use crate::supervisor::{ConnectivitySupervisor, PRESENCE_DEGRADED, PRESENCE_ONLINE};
use crate::topics::Channel;
use crate::transport::Transport;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat<'a> {
    pub uptime: u64,
    pub rssi: Option<i8>,
    pub free_heap: u32,
    pub is_healthy: bool,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot<'a> {
    pub device_id: &'a str,
    pub tenant_id: &'a str,
    pub firmware_version: &'a str,
    pub uptime: u64,
    pub ota_in_progress: bool,
    pub ota_state: OtaState,
    pub health: &'a HealthSnapshot,
    pub gpio: BTreeMap<String, u16>,
}

/// Inputs sampled once per tick by the runtime.
pub struct PresenceView<'a, B> {
    pub identity: &'a DeviceIdentity,
    pub firmware_version: &'a str,
    pub board: &'a B,
    pub health: &'a HealthSnapshot,
    pub ota: OtaState,
}

pub struct PresencePublisher {
    timing: TimingConfig,
    last_heartbeat: Option<Duration>,
    last_state: Option<Duration>,
    state_dirty: bool,
    seen_epoch: u64,
}

impl PresencePublisher {
    pub fn new(timing: TimingConfig) -> Self {
        Self {
            timing,
            last_heartbeat: None,
            last_state: None,
            state_dirty: true,
            seen_epoch: 0,
        }
    }

    /// Request a state snapshot on the next tick.
    pub fn mark_dirty(&mut self) {
        self.state_dirty = true;
    }

    pub fn tick<T, B>(
        &mut self,
        now: Duration,
        sup: &mut ConnectivitySupervisor<T>,
        view: &PresenceView<'_, B>,
    ) where
        T: Transport,
        B: IoCapabilities + SystemProbe,
    {
        if !sup.is_connected() {
            return;
        }

        if sup.session_epoch() != self.seen_epoch {
            self.seen_epoch = sup.session_epoch();
            self.last_heartbeat = None;
            self.state_dirty = true;
            if !view.health.is_healthy {
                // Session handshake announced online; correct it
                self.publish_presence(now, sup, PRESENCE_DEGRADED);
            }
        }

        let heartbeat_due = self
            .last_heartbeat
            .map_or(true, |last| now.saturating_sub(last) >= self.timing.heartbeat_interval());
        if heartbeat_due && !self.send_heartbeat(now, sup, view) {
            return;
        }

        if view.ota.holds_bandwidth() {
            return;
        }
        let state_due = self.state_dirty
            || self
                .last_state
                .map_or(true, |last| now.saturating_sub(last) >= self.timing.state_interval());
        if state_due {
            self.send_state(now, sup, view);
        }
    }

    /// Republish presence on a health edge. Transport loss is left to the
    /// last will.
    pub fn announce_health<T: Transport>(
        &mut self,
        now: Duration,
        sup: &mut ConnectivitySupervisor<T>,
        edge: HealthEdge,
    ) {
        if !sup.is_connected() {
            return;
        }
        let payload = match edge {
            HealthEdge::BecameUnhealthy => PRESENCE_DEGRADED,
            HealthEdge::Recovered => PRESENCE_ONLINE,
        };
        self.publish_presence(now, sup, payload);
        self.state_dirty = true;
    }

    fn publish_presence<T: Transport>(
        &mut self,
        now: Duration,
        sup: &mut ConnectivitySupervisor<T>,
        payload: &str,
    ) {
        match sup.publish_channel(now, Channel::Presence, payload.as_bytes()) {
            Ok(()) => log::info!("Presence -> {}", payload),
            Err(e) => log::warn!("Presence publish failed: {}", e),
        }
    }

    /// Returns false if the heartbeat could not be sent and the session was
    /// dropped.
    fn send_heartbeat<T, B>(
        &mut self,
        now: Duration,
        sup: &mut ConnectivitySupervisor<T>,
        view: &PresenceView<'_, B>,
    ) -> bool
    where
        T: Transport,
        B: IoCapabilities + SystemProbe,
    {
        let heartbeat = Heartbeat {
            uptime: now.as_secs(),
            rssi: view.board.rssi_dbm(),
            free_heap: view.board.free_heap(),
            is_healthy: view.health.is_healthy,
            error_count: view.health.error_count,
            last_error: view.health.last_error.as_deref(),
        };
        let payload = match serde_json::to_vec(&heartbeat) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Heartbeat encode failed: {}", e);
                return true;
            }
        };
        match sup.publish_channel(now, Channel::Heartbeat, &payload) {
            Ok(()) => {
                self.last_heartbeat = Some(now);
                true
            }
            Err(e) => {
                // Send failed on a session that claims to be up: the socket is dead
                log::warn!("Heartbeat publish failed: {}", e);
                sup.force_reconnect(now, "heartbeat publish failed");
                false
            }
        }
    }

    fn send_state<T, B>(
        &mut self,
        now: Duration,
        sup: &mut ConnectivitySupervisor<T>,
        view: &PresenceView<'_, B>,
    ) where
        T: Transport,
        B: IoCapabilities + SystemProbe,
    {
        let snapshot = StateSnapshot {
            device_id: &view.identity.device_id,
            tenant_id: &view.identity.tenant_id,
            firmware_version: view.firmware_version,
            uptime: now.as_secs(),
            ota_in_progress: view.ota.is_active(),
            ota_state: view.ota,
            health: view.health,
            gpio: view
                .board
                .pin_states()
                .into_iter()
                .map(|(pin, level)| (pin.to_string(), level))
                .collect(),
        };
        let payload = match serde_json::to_vec(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("State snapshot encode failed: {}", e);
                return;
            }
        };
        match sup.publish_channel(now, Channel::State, &payload) {
            Ok(()) => {
                self.last_state = Some(now);
                self.state_dirty = false;
            }
            Err(e) => log::warn!("State publish failed: {}", e),
        }
    }
}
