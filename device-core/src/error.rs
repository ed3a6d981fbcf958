use thiserror::Error;

/// Link or session level failure. Never fatal: the supervisor absorbs it
/// into the reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("link down")]
    LinkDown,
    #[error("not connected")]
    NotConnected,
    #[error("timed out")]
    Timeout,
    #[error("session refused: {0}")]
    Refused(String),
    /// Credential rejected at the session handshake.
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Malformed or semantically invalid command payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("parse error")]
    Malformed(String),
    #[error("parse error: missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("{0}")]
    InvalidParameter(String),
}

/// Failure reported by the pin/PWM/ADC layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("unsupported pin {0}")]
    UnsupportedPin(u8),
    #[error("hardware error: {0}")]
    Hardware(String),
}

/// Top-level taxonomy used where several component errors meet.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("ota: {0}")]
    Ota(#[from] crate::ota::OtaError),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T, E = CoreError> = core::result::Result<T, E>;
