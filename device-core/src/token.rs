//! Session credential: a compact HS256 JWT signed with the device key.

use core::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::{DeviceIdentity, TokenConfig};
use crate::error::CoreError;

type HmacSha256 = Hmac<Sha256>;

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
    pub tenant: String,
    pub role: String,
}

struct Issued {
    token: String,
    /// Uptime at which the token should be replaced.
    refresh_at: Duration,
}

pub struct TokenIssuer {
    subject: String,
    tenant: String,
    key: Vec<u8>,
    config: TokenConfig,
    /// `unix_secs - uptime_secs` once wall time is known.
    wall_offset: Option<u64>,
    current: Option<Issued>,
}

impl TokenIssuer {
    pub fn new(identity: &DeviceIdentity, config: TokenConfig) -> Self {
        Self {
            subject: identity.device_id.clone(),
            tenant: identity.tenant_id.clone(),
            key: identity.device_key.as_bytes().to_vec(),
            config,
            wall_offset: None,
            current: None,
        }
    }

    pub fn sync_wall_clock(&mut self, now: Duration, unix_secs: u64) {
        let offset = unix_secs.saturating_sub(now.as_secs());
        if self.wall_offset != Some(offset) {
            log::info!("Token issuer synced to wall clock ({} s)", unix_secs);
            self.wall_offset = Some(offset);
            // iat/exp of the cached token were computed on the other clock
            self.current = None;
        }
    }

    pub fn has_wall_clock(&self) -> bool {
        self.wall_offset.is_some()
    }

    /// Drop the cached token, e.g. after the broker refused it.
    pub fn invalidate(&mut self) {
        self.current = None;
    }

    /// Current token, reissued when missing or within the refresh margin.
    pub fn credential(&mut self, now: Duration) -> Result<String, CoreError> {
        if let Some(issued) = &self.current {
            if now < issued.refresh_at {
                return Ok(issued.token.clone());
            }
        }
        let token = self.issue(now)?;
        let lifetime = self.config.lifetime_secs;
        let refresh_in = lifetime.saturating_sub(self.config.refresh_margin_secs);
        self.current = Some(Issued {
            token: token.clone(),
            refresh_at: now + Duration::from_secs(refresh_in),
        });
        log::debug!("Issued session token valid for {} s", lifetime);
        Ok(token)
    }

    fn issue(&self, now: Duration) -> Result<String, CoreError> {
        let iat = self.wall_offset.unwrap_or(0) + now.as_secs();
        let claims = Claims {
            sub: self.subject.clone(),
            iat,
            exp: iat + self.config.lifetime_secs,
            tenant: self.tenant.clone(),
            role: "device".into(),
        };
        let payload = serde_json::to_vec(&claims)?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = sign(&self.key, signing_input.as_bytes())?;
        Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)))
    }
}

fn sign(key: &[u8], message: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CoreError::Config(format!("device key unusable: {e}")))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}
