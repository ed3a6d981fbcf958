//! Seam between the core and the radio + broker session.
//!
//! The firmware implements [`Transport`] on top of ESP-IDF Wi-Fi and the
//! ESP-MQTT client. Only the connectivity supervisor holds the implementation;
//! everything else publishes through the supervisor.

use std::collections::VecDeque;

use crate::error::TransportError;

/// Message the broker publishes for us if the session dies without a clean
/// disconnect. Must be handed to the handshake, never published later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u16,
    pub last_will: LastWill,
}

impl core::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("last_will", &self.last_will)
            .finish()
    }
}

/// Progress of a handshake started with [`Transport::begin_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionProgress {
    Pending,
    Established,
    Failed(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Messages received from the broker, drained once per tick in arrival order.
#[derive(Debug, Default)]
pub struct InboundQueue {
    messages: VecDeque<InboundMessage>,
    capacity: usize,
    dropped: u32,
}

impl InboundQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Room left before [`InboundQueue::push`] starts discarding.
    pub fn remaining(&self) -> usize {
        if self.capacity == 0 {
            usize::MAX
        } else {
            self.capacity.saturating_sub(self.messages.len())
        }
    }

    /// Queue a message. When full the oldest message is discarded; transports
    /// avoid that by honouring [`InboundQueue::remaining`].
    pub fn push(&mut self, message: InboundMessage) {
        if self.capacity > 0 && self.messages.len() >= self.capacity {
            self.messages.pop_front();
            self.dropped = self.dropped.saturating_add(1);
            log::warn!("Inbound queue full, dropped oldest message");
        }
        self.messages.push_back(message);
    }

    pub fn pop(&mut self) -> Option<InboundMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

/// Raw link + publish/subscribe primitive.
///
/// Every method must return promptly; anything that takes longer than a tick
/// is modelled as "begin" plus a later poll.
pub trait Transport {
    /// Start (or restart) associating the radio link.
    fn begin_link(&mut self) -> Result<(), TransportError>;

    fn link_up(&self) -> bool;

    /// Start the broker handshake. The last will in `options` is registered
    /// as part of this handshake.
    fn begin_session(&mut self, options: &SessionOptions) -> Result<(), TransportError>;

    fn poll_session(&mut self) -> SessionProgress;

    /// What the underlying library believes. May stay `true` on a dead socket.
    fn session_alive(&self) -> bool;

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError>;

    /// Move received messages into `inbox`, oldest first, up to
    /// `inbox.remaining()`. Anything left over stays with the transport for a
    /// later call. Returns the number of messages moved.
    fn drain_into(&mut self, inbox: &mut InboundQueue) -> usize;

    /// Close the session. An implementation may send a clean disconnect, in
    /// which case the broker discards the last will; the supervisor publishes
    /// offline itself before calling this.
    fn teardown(&mut self);
}
