use core::time::Duration;

use sha2::{Digest, Sha256};

use super::{hex, OtaState};

/// Bookkeeping for the one update in flight.
#[derive(Debug, Clone)]
pub struct OtaSession {
    pub state: OtaState,
    pub source_url: String,
    /// Lowercase hex.
    pub expected_digest: String,
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub started_at: Duration,
    pub retry_count: u32,
    pub(super) hasher: Sha256,
    pub(super) stream_open: bool,
    pub(super) last_data_at: Duration,
    /// Not before this instant may the next download attempt start.
    pub(super) resume_at: Duration,
    pub(super) last_reported_percent: Option<u8>,
}

impl OtaSession {
    pub(super) fn new(source_url: &str, expected_digest: &str, now: Duration) -> Self {
        Self {
            state: OtaState::Requested,
            source_url: source_url.to_string(),
            expected_digest: expected_digest.to_ascii_lowercase(),
            total_bytes: None,
            downloaded_bytes: 0,
            started_at: now,
            retry_count: 0,
            hasher: Sha256::new(),
            stream_open: false,
            last_data_at: now,
            resume_at: now,
            last_reported_percent: None,
        }
    }

    pub fn progress_percent(&self) -> Option<u8> {
        let total = self.total_bytes.filter(|t| *t > 0)?;
        Some((self.downloaded_bytes.min(total) * 100 / total) as u8)
    }

    /// Forget everything written so far; the next attempt starts at byte 0.
    pub(super) fn restart(&mut self) {
        self.hasher = Sha256::new();
        self.downloaded_bytes = 0;
        self.stream_open = false;
        self.last_reported_percent = None;
    }

    pub(super) fn absorb(&mut self, data: &[u8], now: Duration) {
        self.hasher.update(data);
        self.downloaded_bytes += data.len() as u64;
        self.last_data_at = now;
    }

    pub(super) fn digest_hex(&self) -> String {
        hex(&self.hasher.clone().finalize())
    }

    /// Percent to report if another `step` boundary was crossed since the
    /// last report.
    pub(super) fn next_report(&mut self, step: u8) -> Option<u8> {
        let percent = self.progress_percent()?;
        let bucket = percent / step * step;
        match self.last_reported_percent {
            Some(last) if bucket <= last => None,
            _ => {
                self.last_reported_percent = Some(bucket);
                Some(bucket)
            }
        }
    }
}
