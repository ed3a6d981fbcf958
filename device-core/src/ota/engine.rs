use core::time::Duration;
use std::collections::VecDeque;

use crate::backoff::Backoff;
use crate::config::OtaConfig;

use super::{
    is_hex_digest, Chunk, DownloadError, FirmwareStore, ImageSource, ImageState, OtaError,
    OtaPhase, OtaSession, OtaState, OtaStatusEvent,
};

const OUTBOX_CAPACITY: usize = 16;

/// Why the engine wants the device restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaReboot {
    /// New image is the next boot target.
    Applied,
    /// Previous image is the next boot target.
    RolledBack,
}

pub struct OtaEngine<F: FirmwareStore, S: ImageSource> {
    store: F,
    source: S,
    config: OtaConfig,
    state: OtaState,
    session: Option<OtaSession>,
    /// Set while the running image awaits confirmation.
    verify_deadline: Option<Duration>,
    retry: Backoff,
    buf: Vec<u8>,
    outbox: VecDeque<OtaStatusEvent>,
}

impl<F: FirmwareStore, S: ImageSource> OtaEngine<F, S> {
    /// Resume from whatever the bootloader reports about the running image.
    pub fn new(store: F, source: S, config: OtaConfig, now: Duration) -> Self {
        let retry = Backoff::from_millis(config.retry_base_ms, config.retry_max_ms);
        let mut engine = Self {
            buf: vec![0; config.chunk_size],
            store,
            source,
            config,
            state: OtaState::Idle,
            session: None,
            verify_deadline: None,
            retry,
            outbox: VecDeque::with_capacity(OUTBOX_CAPACITY),
        };

        match engine.store.running_image() {
            ImageState::Valid => {}
            ImageState::PendingVerify => {
                let deadline = now + engine.config.grace_window();
                log::warn!(
                    "Running unconfirmed firmware, {} s to reach the broker",
                    engine.config.grace_window().as_secs()
                );
                engine.state = OtaState::PendingVerify;
                engine.verify_deadline = Some(deadline);
            }
            ImageState::Reverted => {
                log::error!("Previous update failed verification, running last known good image");
                engine.state = OtaState::RolledBack;
                engine.emit(OtaStatusEvent::new(
                    OtaPhase::Error,
                    "update rolled back: new firmware failed verification",
                ));
            }
        }
        engine
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn session(&self) -> Option<&OtaSession> {
        self.session.as_ref()
    }

    pub fn store(&self) -> &F {
        &self.store
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Accept or refuse a new update. Never blocks; the work happens in
    /// [`OtaEngine::step`].
    pub fn request(
        &mut self,
        now: Duration,
        source_url: &str,
        expected_digest: &str,
        healthy: bool,
    ) -> Result<(), OtaError> {
        if self.state.is_active() {
            return Err(OtaError::Busy);
        }
        let scheme_ok = source_url
            .get(..8)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"));
        if !scheme_ok {
            return Err(OtaError::InsecureSource(source_url.to_string()));
        }
        if !is_hex_digest(expected_digest) {
            return Err(OtaError::InvalidDigest);
        }
        if !healthy {
            return Err(OtaError::Unhealthy);
        }

        log::info!("OTA requested from {}", source_url);
        self.session = Some(OtaSession::new(source_url, expected_digest, now));
        self.set_state(OtaState::Requested);
        self.emit(OtaStatusEvent::new(OtaPhase::Starting, "update requested"));
        Ok(())
    }

    /// One bounded slice of work. `session_up` feeds post-boot verification.
    pub fn step(&mut self, now: Duration, session_up: bool) -> Option<OtaReboot> {
        match self.state {
            OtaState::Requested => {
                self.open_stream(now);
                None
            }
            OtaState::Downloading => {
                self.download(now);
                None
            }
            OtaState::Validating => self.validate_and_apply(),
            OtaState::PendingVerify => self.verify(now, session_up),
            OtaState::Idle
            | OtaState::Applying
            | OtaState::Committed
            | OtaState::Aborted
            | OtaState::RolledBack => None,
        }
    }

    pub fn next_event(&mut self) -> Option<OtaStatusEvent> {
        self.outbox.pop_front()
    }

    /// Put back an event that could not be delivered.
    pub fn requeue_event(&mut self, event: OtaStatusEvent) {
        self.outbox.push_front(event);
    }

    pub fn pending_events(&self) -> usize {
        self.outbox.len()
    }

    fn open_stream(&mut self, now: Duration) {
        let Some(session) = self.session.as_mut() else {
            self.set_state(OtaState::Idle);
            return;
        };
        if now < session.resume_at {
            return;
        }
        session.restart();
        match self.source.open(&session.source_url) {
            Ok(total) => {
                if let Some(total) = total.filter(|t| *t > self.config.max_image_bytes) {
                    self.source.close();
                    self.abort(OtaError::TooLarge(total));
                    return;
                }
                session.total_bytes = total;
                session.stream_open = true;
                session.last_data_at = now;
                if let Err(e) = self.store.begin(total) {
                    self.source.close();
                    self.abort(e);
                    return;
                }
                let mut event = OtaStatusEvent::new(OtaPhase::Downloading, "download started");
                event.total_bytes = total;
                event.downloaded_bytes = Some(0);
                event.progress_percent = session.next_report(self.config.progress_step_percent);
                self.set_state(OtaState::Downloading);
                self.emit(event);
            }
            Err(e) => self.download_failed(now, e),
        }
    }

    fn download(&mut self, now: Duration) {
        if !self.session.as_ref().is_some_and(|s| s.stream_open) {
            self.open_stream(now);
            return;
        }
        for _ in 0..self.config.chunks_per_tick {
            let result = self.source.read(&mut self.buf);
            match result {
                Ok(Chunk::Data(0)) | Ok(Chunk::Pending) => {
                    self.check_stall(now);
                    return;
                }
                Ok(Chunk::Data(n)) => {
                    if let Err(e) = self.accept_chunk(now, n) {
                        self.source.close();
                        self.store.discard();
                        self.abort(e);
                        return;
                    }
                }
                Ok(Chunk::Done) => {
                    self.finish_download(now);
                    return;
                }
                Err(e) => {
                    self.download_failed(now, e);
                    return;
                }
            }
        }
    }

    fn accept_chunk(&mut self, now: Duration, n: usize) -> Result<(), OtaError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let n = n.min(self.buf.len());
        let after = session.downloaded_bytes + n as u64;
        let limit = session.total_bytes.unwrap_or(self.config.max_image_bytes);
        if after > limit || after > self.config.max_image_bytes {
            return Err(OtaError::TooLarge(after));
        }
        self.store.write(&self.buf[..n])?;
        session.absorb(&self.buf[..n], now);

        if let Some(percent) = session.next_report(self.config.progress_step_percent) {
            log::info!("OTA progress {}%", percent);
            let mut event = OtaStatusEvent::new(OtaPhase::Downloading, format!("{}%", percent));
            event.progress_percent = Some(percent);
            event.total_bytes = session.total_bytes;
            event.downloaded_bytes = Some(session.downloaded_bytes);
            self.emit(event);
        }
        Ok(())
    }

    fn check_stall(&mut self, now: Duration) {
        let stalled = self
            .session
            .as_ref()
            .is_some_and(|s| now.saturating_sub(s.last_data_at) > self.config.stall_timeout());
        if stalled {
            self.download_failed(now, DownloadError::Stalled);
        }
    }

    fn finish_download(&mut self, now: Duration) {
        self.source.close();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stream_open = false;
        if let Some(expected) = session.total_bytes {
            if session.downloaded_bytes != expected {
                let got = session.downloaded_bytes;
                self.download_failed(now, DownloadError::Truncated { got, expected });
                return;
            }
        }
        log::info!("OTA download complete ({} bytes)", session.downloaded_bytes);
        self.set_state(OtaState::Validating);
        self.emit(OtaStatusEvent::new(OtaPhase::Validating, "verifying image digest"));
    }

    /// Transient errors restart the download after a backoff, up to the
    /// retry limit. Anything else aborts.
    fn download_failed(&mut self, now: Duration, error: DownloadError) {
        self.source.close();
        self.store.discard();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stream_open = false;

        if !error.is_transient() {
            self.abort(OtaError::Download(error));
            return;
        }
        if session.retry_count >= self.config.max_retries {
            let attempts = session.retry_count + 1;
            self.abort(OtaError::RetriesExhausted { attempts, last: error });
            return;
        }
        let delay = self.retry.delay_for(session.retry_count);
        session.retry_count += 1;
        session.resume_at = now + delay;
        log::warn!(
            "OTA download error: {} (retry {}/{} in {} ms)",
            error,
            session.retry_count,
            self.config.max_retries,
            delay.as_millis()
        );
        let retry_count = session.retry_count;
        self.emit(OtaStatusEvent::new(
            OtaPhase::Downloading,
            format!("retrying after error: {} ({}/{})", error, retry_count, self.config.max_retries),
        ));
    }

    fn validate_and_apply(&mut self) -> Option<OtaReboot> {
        let session = self.session.as_ref()?;
        let actual = session.digest_hex();
        if actual != session.expected_digest {
            let expected = session.expected_digest.clone();
            self.store.discard();
            self.abort(OtaError::DigestMismatch { expected, actual });
            return None;
        }
        let applied = match self.store.finish() {
            Ok(()) => self.store.activate(),
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            self.store.discard();
            self.abort(e);
            return None;
        }

        log::info!("OTA image verified, switching boot target");
        self.set_state(OtaState::Applying);
        self.emit(OtaStatusEvent::new(OtaPhase::Applying, "image verified, boot target set"));
        self.emit(OtaStatusEvent::new(OtaPhase::Rebooting, "rebooting into new firmware"));
        Some(OtaReboot::Applied)
    }

    fn verify(&mut self, now: Duration, session_up: bool) -> Option<OtaReboot> {
        if session_up {
            match self.store.mark_valid() {
                Ok(()) => {
                    log::info!("New firmware confirmed");
                    self.verify_deadline = None;
                    self.set_state(OtaState::Committed);
                    self.emit(OtaStatusEvent::new(OtaPhase::Success, "firmware update committed"));
                    return None;
                }
                Err(e) => {
                    log::error!("Could not confirm running firmware: {}", e);
                    return self.roll_back(e.to_string());
                }
            }
        }
        match self.verify_deadline {
            Some(deadline) if now >= deadline => {
                self.roll_back(OtaError::VerificationTimeout.to_string())
            }
            _ => None,
        }
    }

    fn roll_back(&mut self, cause: String) -> Option<OtaReboot> {
        log::error!("Rolling back firmware: {}", cause);
        if let Err(e) = self.store.rollback() {
            // The bootloader still reverts an unconfirmed image on restart
            log::error!("{}", e);
        }
        self.verify_deadline = None;
        self.set_state(OtaState::RolledBack);
        self.emit(OtaStatusEvent::new(
            OtaPhase::Error,
            format!("rolled back: {}", cause),
        ));
        Some(OtaReboot::RolledBack)
    }

    fn abort(&mut self, error: OtaError) {
        log::error!("OTA aborted: {}", error);
        self.set_state(OtaState::Aborted);
        self.session = None;
        self.emit(OtaStatusEvent::new(OtaPhase::Error, error.to_string()));
    }

    fn set_state(&mut self, next: OtaState) {
        if self.state != next {
            log::debug!("OTA {} -> {}", self.state, next);
        }
        self.state = next;
        if let Some(session) = self.session.as_mut() {
            session.state = next;
        }
    }

    fn emit(&mut self, event: OtaStatusEvent) {
        if self.outbox.len() == OUTBOX_CAPACITY {
            self.outbox.pop_front();
        }
        self.outbox.push_back(event);
    }
}
