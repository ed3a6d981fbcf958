//! Tenant- and device-scoped topic namespace.
//!
//! Every channel lives under `saphari/{tenant}/devices/{device}/`.

use crate::config::DeviceIdentity;

pub const TOPIC_ROOT: &str = "saphari";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Presence,
    State,
    Heartbeat,
    Command,
    Ack,
    OtaStatus,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Presence,
        Channel::State,
        Channel::Heartbeat,
        Channel::Command,
        Channel::Ack,
        Channel::OtaStatus,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Channel::Presence => "status",
            Channel::State => "state",
            Channel::Heartbeat => "heartbeat",
            Channel::Command => "cmd",
            Channel::Ack => "ack",
            Channel::OtaStatus => "ota_status",
        }
    }

    /// Broker-side retention for messages on this channel.
    pub fn retained(self) -> bool {
        matches!(self, Channel::Presence | Channel::State | Channel::Ack)
    }
}

#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
    presence: String,
    state: String,
    heartbeat: String,
    command: String,
    ack: String,
    ota_status: String,
}

impl Topics {
    pub fn new(identity: &DeviceIdentity) -> Self {
        let base = format!(
            "{}/{}/devices/{}",
            TOPIC_ROOT, identity.tenant_id, identity.device_id
        );
        let join = |channel: Channel| format!("{}/{}", base, channel.suffix());
        Self {
            presence: join(Channel::Presence),
            state: join(Channel::State),
            heartbeat: join(Channel::Heartbeat),
            command: join(Channel::Command),
            ack: join(Channel::Ack),
            ota_status: join(Channel::OtaStatus),
            base,
        }
    }

    pub fn topic(&self, channel: Channel) -> &str {
        match channel {
            Channel::Presence => &self.presence,
            Channel::State => &self.state,
            Channel::Heartbeat => &self.heartbeat,
            Channel::Command => &self.command,
            Channel::Ack => &self.ack,
            Channel::OtaStatus => &self.ota_status,
        }
    }

    /// Resolve an inbound topic to one of our channels. Topics outside this
    /// device's namespace resolve to `None`.
    pub fn channel_of(&self, topic: &str) -> Option<Channel> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        Channel::ALL.into_iter().find(|c| c.suffix() == rest)
    }
}
