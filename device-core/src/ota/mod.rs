//! Dual-bank firmware update: download, digest check, apply, post-boot
//! verification and rollback.

mod engine;
mod session;

pub use engine::{OtaEngine, OtaReboot};
pub use session::OtaSession;

use serde::Serialize;
use strum::Display;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("timed out")]
    Timeout,
    #[error("connection reset")]
    Reset,
    #[error("stalled: no data received")]
    Stalled,
    #[error("truncated: got {got} of {expected} bytes")]
    Truncated { got: u64, expected: u64 },
    #[error("http status {0}")]
    Http(u16),
    #[error("i/o: {0}")]
    Io(String),
}

impl DownloadError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Reset | Self::Stalled | Self::Truncated { .. } | Self::Io(_) => {
                true
            }
            Self::Http(status) => *status >= 500 || *status == 408 || *status == 429,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("update already in progress")]
    Busy,
    #[error("source url must use https: {0}")]
    InsecureSource(String),
    #[error("expected digest must be 64 hex characters")]
    InvalidDigest,
    #[error("device unhealthy, update refused")]
    Unhealthy,
    #[error("download failed: {0}")]
    Download(DownloadError),
    #[error("download failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: DownloadError },
    #[error("image too large: {0} bytes")]
    TooLarge(u64),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("flash: {0}")]
    Store(String),
    #[error("new firmware did not reconnect within the grace window")]
    VerificationTimeout,
    #[error("rollback failed: {0}")]
    Rollback(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OtaState {
    Idle,
    Requested,
    Downloading,
    Validating,
    Applying,
    PendingVerify,
    Committed,
    Aborted,
    RolledBack,
}

impl OtaState {
    /// An update occupies the engine; new requests are refused.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Requested | Self::Downloading | Self::Validating | Self::Applying | Self::PendingVerify
        )
    }

    /// Other publishers hold back large payloads in these states.
    pub fn holds_bandwidth(self) -> bool {
        matches!(self, Self::Downloading | Self::Applying)
    }
}

/// What the bootloader says about the image we are running from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Valid,
    /// First boot of a freshly applied image, not yet confirmed.
    PendingVerify,
    /// The bootloader fell back here after a newer image failed to verify.
    Reverted,
}

/// Inactive flash bank plus boot selection.
pub trait FirmwareStore {
    fn running_image(&mut self) -> ImageState;
    /// Erase and open the inactive bank.
    fn begin(&mut self, size_hint: Option<u64>) -> Result<(), OtaError>;
    fn write(&mut self, data: &[u8]) -> Result<(), OtaError>;
    /// Abandon a partially written bank. Boot selection is untouched.
    fn discard(&mut self);
    /// Close the bank; the platform may validate the image header here.
    fn finish(&mut self) -> Result<(), OtaError>;
    /// Make the written bank the next boot target.
    fn activate(&mut self) -> Result<(), OtaError>;
    /// Confirm the running image and cancel any pending rollback.
    fn mark_valid(&mut self) -> Result<(), OtaError>;
    /// Point the next boot back at the previous bank.
    fn rollback(&mut self) -> Result<(), OtaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    Data(usize),
    /// Nothing available yet; try again next tick.
    Pending,
    Done,
}

/// Streaming image download over an encrypted transport.
pub trait ImageSource {
    /// Start a request. Returns the content length if the server sent one.
    fn open(&mut self, url: &str) -> Result<Option<u64>, DownloadError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<Chunk, DownloadError>;
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OtaPhase {
    Starting,
    Downloading,
    Validating,
    Applying,
    Rebooting,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaStatusEvent {
    pub state: OtaPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
}

impl OtaStatusEvent {
    pub fn new(state: OtaPhase, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            progress_percent: None,
            total_bytes: None,
            downloaded_bytes: None,
        }
    }
}

pub(crate) fn is_hex_digest(digest: &str) -> bool {
    digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit())
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use core::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}
