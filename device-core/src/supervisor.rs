//! Connect/reconnect state machine over the [`Transport`].
//!
//! Owns the only transport handle. Other components publish through
//! [`ConnectivitySupervisor::publish`] and never cache the connection state
//! across ticks.

use core::time::Duration;
use std::collections::VecDeque;

use strum::Display;

use crate::backoff::Backoff;
use crate::config::{DeviceIdentity, TimingConfig, TokenConfig};
use crate::error::TransportError;
use crate::token::TokenIssuer;
use crate::topics::{Channel, Topics};
use crate::transport::{
    InboundMessage, InboundQueue, LastWill, SessionOptions, SessionProgress, Transport,
};

pub const PRESENCE_ONLINE: &str = "online";
pub const PRESENCE_OFFLINE: &str = "offline";
pub const PRESENCE_DEGRADED: &str = "degraded";

const HISTORY_LEN: usize = 32;
const INBOUND_CAPACITY: usize = 32;
/// Upper bound on state steps taken by one `ensure_connected` call.
const MAX_STEPS_PER_TICK: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Disconnected,
    LinkConnecting,
    LinkConnected,
    SessionConnecting,
    SessionConnected,
    Stale,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::LinkConnecting => 1,
            Self::LinkConnected => 2,
            Self::SessionConnecting => 3,
            Self::SessionConnected => 4,
            Self::Stale => 5,
        }
    }

    /// Forward by exactly one step, `SessionConnected -> Stale`, or back to
    /// `Disconnected`. `Stale` may only go to `Disconnected`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        match (self, next) {
            (_, Self::Disconnected) => self != Self::Disconnected,
            (Self::Stale, _) => false,
            (Self::SessionConnected, Self::Stale) => true,
            (_, Self::Stale) => false,
            _ => next.rank() == self.rank() + 1,
        }
    }

    pub fn is_connected(self) -> bool {
        self == Self::SessionConnected
    }
}

pub struct ConnectivitySupervisor<T: Transport> {
    transport: T,
    state: ConnectionState,
    topics: Topics,
    client_id: String,
    username: String,
    token: TokenIssuer,
    timing: TimingConfig,
    backoff: Backoff,
    /// When the current connecting phase started.
    phase_started: Duration,
    last_activity: Duration,
    epoch: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
    inbound: InboundQueue,
    history: VecDeque<ConnectionState>,
}

impl<T: Transport> ConnectivitySupervisor<T> {
    pub fn new(
        transport: T,
        identity: &DeviceIdentity,
        timing: TimingConfig,
        token: TokenConfig,
    ) -> Self {
        let backoff = Backoff::from_millis(timing.reconnect_base_ms, timing.reconnect_max_ms);
        let mut history = VecDeque::with_capacity(HISTORY_LEN);
        history.push_back(ConnectionState::Disconnected);
        Self {
            transport,
            state: ConnectionState::Disconnected,
            topics: Topics::new(identity),
            client_id: format!("saphari-{}", identity.device_id),
            username: identity.device_id.clone(),
            token: TokenIssuer::new(identity, token),
            timing,
            backoff,
            phase_started: Duration::ZERO,
            last_activity: Duration::ZERO,
            epoch: 0,
            consecutive_failures: 0,
            last_error: None,
            inbound: InboundQueue::with_capacity(INBOUND_CAPACITY),
            history,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn link_up(&self) -> bool {
        self.transport.link_up()
    }

    /// Incremented on every successful handshake.
    pub fn session_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Recent states, oldest first.
    pub fn history(&self) -> impl Iterator<Item = ConnectionState> + '_ {
        self.history.iter().copied()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sync_wall_clock(&mut self, now: Duration, unix_secs: u64) {
        self.token.sync_wall_clock(now, unix_secs);
    }

    /// Advance the state machine without blocking and return where it ended.
    /// Safe to call every tick.
    pub fn ensure_connected(&mut self, now: Duration) -> ConnectionState {
        for _ in 0..MAX_STEPS_PER_TICK {
            let before = self.state;
            self.step(now);
            if self.state == before || self.state == ConnectionState::SessionConnected {
                break;
            }
        }
        self.state
    }

    fn step(&mut self, now: Duration) {
        match self.state {
            ConnectionState::Disconnected => {
                if !self.backoff.is_due(now) {
                    return;
                }
                self.backoff.mark_attempt(now);
                log::info!(
                    "Connecting (attempt {})",
                    self.consecutive_failures.saturating_add(1)
                );
                match self.transport.begin_link() {
                    Ok(()) => {
                        self.phase_started = now;
                        self.transition(ConnectionState::LinkConnecting);
                    }
                    Err(e) => self.fail(now, e),
                }
            }
            ConnectionState::LinkConnecting => {
                if self.transport.link_up() {
                    self.transition(ConnectionState::LinkConnected);
                } else if now.saturating_sub(self.phase_started) > self.timing.link_connect_timeout()
                {
                    self.fail(now, TransportError::Timeout);
                }
            }
            ConnectionState::LinkConnected => {
                if !self.transport.link_up() {
                    self.fail(now, TransportError::LinkDown);
                    return;
                }
                let options = match self.session_options(now) {
                    Ok(options) => options,
                    Err(e) => {
                        self.fail(now, e);
                        return;
                    }
                };
                match self.transport.begin_session(&options) {
                    Ok(()) => {
                        self.phase_started = now;
                        self.transition(ConnectionState::SessionConnecting);
                    }
                    Err(e) => self.fail(now, e),
                }
            }
            ConnectionState::SessionConnecting => {
                if !self.transport.link_up() {
                    self.fail(now, TransportError::LinkDown);
                    return;
                }
                match self.transport.poll_session() {
                    SessionProgress::Established => self.on_established(now),
                    SessionProgress::Failed(e) => self.fail(now, e),
                    SessionProgress::Pending => {
                        if now.saturating_sub(self.phase_started)
                            > self.timing.session_connect_timeout()
                        {
                            self.fail(now, TransportError::Timeout);
                        }
                    }
                }
            }
            ConnectionState::SessionConnected => {
                if !self.transport.link_up() {
                    self.fail(now, TransportError::LinkDown);
                } else if !self.transport.session_alive() {
                    self.fail(now, TransportError::NotConnected);
                } else if now.saturating_sub(self.last_activity) > self.timing.stale_timeout() {
                    self.go_stale(now, "no activity within staleness threshold");
                }
            }
            ConnectionState::Stale => self.transition(ConnectionState::Disconnected),
        }
    }

    fn session_options(&mut self, now: Duration) -> Result<SessionOptions, TransportError> {
        let password = self
            .token
            .credential(now)
            .map_err(|e| TransportError::Auth(e.to_string()))?;
        Ok(SessionOptions {
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password,
            keep_alive_secs: self.timing.keep_alive_secs,
            last_will: LastWill {
                topic: self.topics.topic(Channel::Presence).to_string(),
                payload: PRESENCE_OFFLINE.as_bytes().to_vec(),
                retain: true,
            },
        })
    }

    fn on_established(&mut self, now: Duration) {
        self.transition(ConnectionState::SessionConnected);
        self.last_activity = now;

        let command_topic = self.topics.topic(Channel::Command).to_string();
        if let Err(e) = self.transport.subscribe(&command_topic) {
            self.fail(now, e);
            return;
        }
        let presence_topic = self.topics.topic(Channel::Presence).to_string();
        if let Err(e) = self
            .transport
            .publish(&presence_topic, PRESENCE_ONLINE.as_bytes(), true)
        {
            self.fail(now, e);
            return;
        }

        self.backoff.reset();
        self.consecutive_failures = 0;
        self.last_error = None;
        self.epoch = self.epoch.wrapping_add(1);
        log::info!("Session established (epoch {})", self.epoch);
    }

    fn fail(&mut self, now: Duration, error: TransportError) {
        log::warn!("Connection failed in {}: {}", self.state, error);
        if error.is_auth() {
            // Next handshake must carry a freshly signed credential
            self.token.invalidate();
        }
        if self.state.rank() >= ConnectionState::SessionConnecting.rank() {
            self.transport.teardown();
        }
        self.backoff.record_failure();
        self.backoff.mark_attempt(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.transition(ConnectionState::Disconnected);

        if self.consecutive_failures == self.timing.diagnostics_after_failures {
            log::warn!(
                "Connection diagnostics: {} consecutive failures, link {}, backoff step {}, next attempt in {} ms, inbound dropped {}, last error: {}",
                self.consecutive_failures,
                if self.transport.link_up() { "up" } else { "down" },
                self.backoff.attempt(),
                self.backoff.remaining(now).as_millis(),
                self.inbound.dropped(),
                self.last_error.as_deref().unwrap_or("none"),
            );
        }
    }

    fn go_stale(&mut self, _now: Duration, reason: &str) {
        log::warn!("Session stale ({}), tearing down transport", reason);
        self.transition(ConnectionState::Stale);
        self.announce_offline();
        self.transport.teardown();
        self.transition(ConnectionState::Disconnected);
    }

    /// Best effort: a teardown may cancel the will, so say it ourselves while
    /// the socket might still carry it.
    fn announce_offline(&mut self) {
        let topic = self.topics.topic(Channel::Presence).to_string();
        if let Err(e) = self
            .transport
            .publish(&topic, PRESENCE_OFFLINE.as_bytes(), true)
        {
            log::debug!("Offline presence not sent before teardown: {}", e);
        }
    }

    /// Drop the session right away, bypassing the staleness timer.
    pub fn force_reconnect(&mut self, now: Duration, reason: &str) {
        match self.state {
            ConnectionState::SessionConnected => self.go_stale(now, reason),
            ConnectionState::Disconnected => {}
            other => {
                log::warn!("Forced reconnect from {} ({})", other, reason);
                if other.rank() >= ConnectionState::SessionConnecting.rank() {
                    self.transport.teardown();
                }
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    /// Reset the staleness clock. Ignored unless the session is up.
    pub fn observe_activity(&mut self, now: Duration) {
        if self.state.is_connected() {
            self.last_activity = now;
        }
    }

    /// Publish on the live session. Success counts as activity; failure is
    /// returned to the caller, which decides whether it is a staleness signal.
    pub fn publish(
        &mut self,
        now: Duration,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.transport.publish(topic, payload, retain)?;
        self.observe_activity(now);
        Ok(())
    }

    /// Publish on one of this device's channels with its retention policy.
    pub fn publish_channel(
        &mut self,
        now: Duration,
        channel: Channel,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let topic = self.topics.topic(channel).to_string();
        self.publish(now, &topic, payload, channel.retained())
    }

    /// Pull what the transport received into the inbound queue, as far as
    /// the queue has room. The rest waits in the transport.
    pub fn poll_inbound(&mut self, now: Duration) -> usize {
        let moved = self.transport.drain_into(&mut self.inbound);
        if moved > 0 {
            self.observe_activity(now);
        }
        moved
    }

    pub fn next_inbound(&mut self) -> Option<InboundMessage> {
        self.inbound.pop()
    }

    pub fn has_inbound(&self) -> bool {
        !self.inbound.is_empty()
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            log::error!("Rejected connection transition {} -> {}", self.state, next);
            return;
        }
        log::debug!("Connection {} -> {}", self.state, next);
        self.state = next;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(next);
    }
}
