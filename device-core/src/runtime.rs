//! Cooperative run loop body. The firmware calls [`DeviceRuntime::tick`]
//! forever; each call gives every component one bounded turn.

use core::time::Duration;
use std::collections::VecDeque;

use serde::Serialize;
use serde_json::{json, Value};

use crate::command::{Ack, CommandHost, CommandProcessor, IoCapabilities};
use crate::config::{CoreConfig, DeviceIdentity};
use crate::error::CoreError;
use crate::health::{HealthMonitor, HealthSnapshot, LinkStatus, SystemProbe};
use crate::ota::{FirmwareStore, ImageSource, OtaEngine, OtaError, OtaReboot, OtaStatusEvent};
use crate::presence::{PresencePublisher, PresenceView};
use crate::supervisor::{ConnectionState, ConnectivitySupervisor};
use crate::topics::Channel;
use crate::transport::Transport;

/// The board: pins plus memory/radio readings.
pub trait Platform: IoCapabilities + SystemProbe {}

impl<P: IoCapabilities + SystemProbe> Platform for P {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    Command,
    OtaApplied,
    OtaRolledBack,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Restart the device after this tick.
    pub reboot: Option<RebootReason>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OtaStatusMessage<'a> {
    #[serde(flatten)]
    event: &'a OtaStatusEvent,
    device_id: &'a str,
    timestamp: u64,
}

struct Host<'a, F: FirmwareStore, S: ImageSource, P: Platform> {
    now: Duration,
    board: &'a mut P,
    ota: &'a mut OtaEngine<F, S>,
    health: &'a HealthSnapshot,
    firmware_version: &'a str,
}

impl<F: FirmwareStore, S: ImageSource, P: Platform> CommandHost for Host<'_, F, S, P> {
    fn io(&mut self) -> &mut dyn IoCapabilities {
        &mut *self.board
    }

    fn request_update(&mut self, source_url: &str, expected_digest: &str) -> Result<(), OtaError> {
        self.ota
            .request(self.now, source_url, expected_digest, self.health.is_healthy)
    }

    fn status_report(&self) -> Value {
        json!({
            "firmwareVersion": self.firmware_version,
            "uptime": self.now.as_secs(),
            "freeHeap": self.board.free_heap(),
            "rssi": self.board.rssi_dbm(),
            "isHealthy": self.health.is_healthy,
            "errorCount": self.health.error_count,
            "ota": {
                "state": self.ota.state(),
                "progressPercent": self.ota.session().and_then(|s| s.progress_percent()),
            },
        })
    }
}

pub struct DeviceRuntime<T, F, S, P>
where
    T: Transport,
    F: FirmwareStore,
    S: ImageSource,
    P: Platform,
{
    identity: DeviceIdentity,
    supervisor: ConnectivitySupervisor<T>,
    presence: PresencePublisher,
    commands: CommandProcessor,
    ota: OtaEngine<F, S>,
    health: HealthMonitor,
    board: P,
    pending_acks: VecDeque<Ack>,
    ack_capacity: usize,
    /// Session epoch the health verdict was last refreshed for.
    health_epoch: u64,
    firmware_version: String,
}

impl<T, F, S, P> DeviceRuntime<T, F, S, P>
where
    T: Transport,
    F: FirmwareStore,
    S: ImageSource,
    P: Platform,
{
    pub fn new(
        identity: DeviceIdentity,
        config: CoreConfig,
        transport: T,
        store: F,
        source: S,
        board: P,
        now: Duration,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let CoreConfig {
            timing,
            health,
            ota,
            commands,
            token,
        } = config;
        let ack_capacity = commands.pending_ack_capacity.max(1);
        log::info!("Device runtime starting for {:?}", identity);
        Ok(Self {
            supervisor: ConnectivitySupervisor::new(transport, &identity, timing.clone(), token),
            presence: PresencePublisher::new(timing),
            commands: CommandProcessor::new(commands),
            ota: OtaEngine::new(store, source, ota, now),
            health: HealthMonitor::new(health),
            board,
            pending_acks: VecDeque::with_capacity(ack_capacity),
            ack_capacity,
            health_epoch: 0,
            firmware_version: String::from("unknown"),
            identity,
        })
    }

    /// Version reported in status replies and state snapshots.
    pub fn set_firmware_version(&mut self, version: impl Into<String>) {
        self.firmware_version = version.into();
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &ConnectivitySupervisor<T> {
        &self.supervisor
    }

    pub fn ota(&self) -> &OtaEngine<F, S> {
        &self.ota
    }

    pub fn health(&self) -> &HealthSnapshot {
        self.health.snapshot()
    }

    pub fn board(&self) -> &P {
        &self.board
    }

    pub fn pending_acks(&self) -> usize {
        self.pending_acks.len()
    }

    pub fn sync_wall_clock(&mut self, now: Duration, unix_secs: u64) {
        self.supervisor.sync_wall_clock(now, unix_secs);
    }

    pub fn tick(&mut self, now: Duration) -> TickOutcome {
        self.supervisor.poll_inbound(now);
        let state = self.supervisor.ensure_connected(now);

        let ota_reboot = self.ota.step(now, state.is_connected());
        self.refresh_health_on_new_session(now);
        let restart_requested = self.dispatch_commands(now);

        if self.supervisor.is_connected() {
            self.flush_acks(now);
            self.flush_ota_events(now);
        }

        if let Some(edge) = self.health.tick(now, self.link_status(), &self.board) {
            self.presence.announce_health(now, &mut self.supervisor, edge);
        }

        let view = PresenceView {
            identity: &self.identity,
            firmware_version: &self.firmware_version,
            board: &self.board,
            health: self.health.snapshot(),
            ota: self.ota.state(),
        };
        self.presence.tick(now, &mut self.supervisor, &view);

        let reboot = match ota_reboot {
            Some(OtaReboot::Applied) => Some(RebootReason::OtaApplied),
            Some(OtaReboot::RolledBack) => Some(RebootReason::OtaRolledBack),
            None if restart_requested => Some(RebootReason::Command),
            None => None,
        };
        if let Some(reason) = reboot {
            log::warn!("Reboot requested: {:?}", reason);
        }
        TickOutcome { reboot }
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus {
            link_up: self.supervisor.link_up(),
            session_up: self.supervisor.is_connected(),
        }
    }

    /// A verdict taken while the session was down is stale once it is back.
    /// Re-evaluate before presence and commands look at it. The handshake
    /// already said online, so an edge here needs no announcement of its own.
    fn refresh_health_on_new_session(&mut self, now: Duration) {
        let epoch = self.supervisor.session_epoch();
        if epoch == self.health_epoch || !self.supervisor.is_connected() {
            return;
        }
        self.health_epoch = epoch;
        self.health.evaluate(now, self.link_status(), &self.board);
    }

    /// Handle queued inbound messages while the ack queue has room. Returns
    /// true if a restart was commanded.
    fn dispatch_commands(&mut self, now: Duration) -> bool {
        let mut restart = false;
        while self.supervisor.has_inbound() {
            if self.pending_acks.len() >= self.ack_capacity {
                if self.supervisor.is_connected() {
                    self.flush_acks(now);
                }
                if self.pending_acks.len() >= self.ack_capacity {
                    log::debug!(
                        "Ack queue full, {} messages wait for the next tick",
                        self.supervisor.pending_inbound()
                    );
                    break;
                }
            }
            let Some(message) = self.supervisor.next_inbound() else {
                break;
            };
            match self.supervisor.topics().channel_of(&message.topic) {
                Some(Channel::Command) => {}
                _ => {
                    log::debug!("Ignoring message on {}", message.topic);
                    continue;
                }
            }
            let mut host = Host {
                now,
                board: &mut self.board,
                ota: &mut self.ota,
                health: self.health.snapshot(),
                firmware_version: &self.firmware_version,
            };
            let handled = self.commands.handle(now, &message.payload, &mut host);
            if handled.effects.state_changed {
                self.presence.mark_dirty();
            }
            restart |= handled.effects.restart;
            self.pending_acks.push_back(handled.ack);
        }
        restart
    }

    fn flush_acks(&mut self, now: Duration) {
        while let Some(ack) = self.pending_acks.front() {
            let payload = match serde_json::to_vec(ack) {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("Ack encode failed: {}", e);
                    self.pending_acks.pop_front();
                    continue;
                }
            };
            if let Err(e) = self.supervisor.publish_channel(now, Channel::Ack, &payload) {
                log::warn!("Ack publish failed, will retry: {}", e);
                return;
            }
            self.pending_acks.pop_front();
        }
    }

    fn flush_ota_events(&mut self, now: Duration) {
        while let Some(event) = self.ota.next_event() {
            let message = OtaStatusMessage {
                event: &event,
                device_id: &self.identity.device_id,
                timestamp: now.as_millis() as u64,
            };
            let payload = match serde_json::to_vec(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("OTA status encode failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = self
                .supervisor
                .publish_channel(now, Channel::OtaStatus, &payload)
            {
                log::warn!("OTA status publish failed, will retry: {}", e);
                self.ota.requeue_event(event);
                return;
            }
        }
    }
}
