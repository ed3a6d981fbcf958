//! Inbound command parsing, dispatch and acknowledgment.
//!
//! Every payload that reaches [`CommandProcessor::handle`] produces exactly
//! one [`Ack`], whatever happens inside the handler.

use core::str::FromStr;
use core::time::Duration;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{AsRefStr, EnumString};

use crate::config::CommandConfig;
use crate::error::{IoError, ProtocolError};
use crate::ota::OtaError;

/// Pin-level capabilities of the board.
pub trait IoCapabilities {
    fn set_output(&mut self, pin: u8, high: bool) -> Result<(), IoError>;
    fn set_pwm(&mut self, pin: u8, duty: u8) -> Result<(), IoError>;
    fn read_digital(&mut self, pin: u8) -> Result<bool, IoError>;
    fn read_analog(&mut self, pin: u8) -> Result<u16, IoError>;
    /// Last level written to each driven pin, for the state snapshot.
    fn pin_states(&self) -> Vec<(u8, u16)>;
}

/// Everything a handler may touch besides the pins.
pub trait CommandHost {
    fn io(&mut self) -> &mut dyn IoCapabilities;
    fn request_update(&mut self, source_url: &str, expected_digest: &str) -> Result<(), OtaError>;
    fn status_report(&self) -> Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Relay,
    DigitalWrite,
    Pwm,
    AnalogWrite,
    DigitalRead,
    AnalogRead,
    Restart,
    StatusRequest,
    OtaUpdate,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    #[serde(alias = "id", alias = "commandId")]
    cmd_id: Option<String>,
    action: Option<String>,
    pin: Option<i64>,
    state: Option<Value>,
    value: Option<i64>,
    #[serde(alias = "sourceUrl")]
    url: Option<String>,
    #[serde(alias = "expectedDigest")]
    checksum: Option<String>,
}

/// A parsed command, alive until its ack is produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub action: Action,
    pub params: Params,
    pub received_at: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    pub pin: Option<i64>,
    pub state: Option<Value>,
    pub value: Option<i64>,
    pub source_url: Option<String>,
    pub expected_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub command_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Milliseconds since boot.
    pub ts: u64,
}

impl Ack {
    fn success(id: &str, result: Option<Value>, now: Duration) -> Self {
        Self {
            command_id: id.to_string(),
            ok: true,
            error_message: None,
            result,
            ts: now.as_millis() as u64,
        }
    }

    fn failure(id: &str, message: impl Into<String>, now: Duration) -> Self {
        Self {
            command_id: id.to_string(),
            ok: false,
            error_message: Some(message.into()),
            result: None,
            ts: now.as_millis() as u64,
        }
    }
}

/// Side effects the runtime must carry out after the ack is queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effects {
    pub state_changed: bool,
    pub restart: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    pub ack: Ack,
    pub effects: Effects,
}

/// Ids of recently handled commands, so redelivered ones are answered from
/// the cache instead of being executed again.
struct RecentCommands {
    capacity: usize,
    entries: VecDeque<Ack>,
}

impl RecentCommands {
    fn get(&self, id: &str) -> Option<&Ack> {
        self.entries.iter().find(|ack| ack.command_id == id)
    }

    fn remember(&mut self, ack: &Ack) {
        if self.capacity == 0 || ack.command_id.is_empty() {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ack.clone());
    }
}

pub struct CommandProcessor {
    config: CommandConfig,
    recent: RecentCommands,
}

type HandlerResult = Result<(Option<Value>, Effects), String>;

impl CommandProcessor {
    pub fn new(config: CommandConfig) -> Self {
        let recent = RecentCommands {
            capacity: config.dedupe_capacity,
            entries: VecDeque::with_capacity(config.dedupe_capacity),
        };
        Self { config, recent }
    }

    pub fn parse(payload: &[u8], now: Duration) -> Result<Command, (String, ProtocolError)> {
        let raw: RawCommand = serde_json::from_slice(payload)
            .map_err(|e| (String::new(), ProtocolError::Malformed(e.to_string())))?;
        let id = raw.cmd_id.unwrap_or_default();
        if id.is_empty() {
            return Err((id, ProtocolError::MissingField("cmd_id")));
        }
        let Some(action) = raw.action else {
            return Err((id, ProtocolError::MissingField("action")));
        };
        let action = match Action::from_str(&action) {
            Ok(action) => action,
            Err(_) => return Err((id, ProtocolError::UnknownAction(action))),
        };
        Ok(Command {
            id,
            action,
            params: Params {
                pin: raw.pin,
                state: raw.state,
                value: raw.value,
                source_url: raw.url,
                expected_digest: raw.checksum,
            },
            received_at: now,
        })
    }

    pub fn handle(&mut self, now: Duration, payload: &[u8], host: &mut dyn CommandHost) -> Handled {
        let command = match Self::parse(payload, now) {
            Ok(command) => command,
            Err((id, error)) => {
                log::warn!("Rejected command {:?}: {}", id, error);
                return Handled {
                    ack: Ack::failure(&id, error.to_string(), now),
                    effects: Effects::default(),
                };
            }
        };

        if let Some(cached) = self.recent.get(&command.id) {
            log::info!("Duplicate command {}, replaying ack", command.id);
            let mut ack = cached.clone();
            ack.ts = now.as_millis() as u64;
            return Handled {
                ack,
                effects: Effects::default(),
            };
        }

        log::info!("Command {} -> {}", command.id, command.action.as_ref());
        let handled = match self.dispatch(&command, host) {
            Ok((result, effects)) => Handled {
                ack: Ack::success(&command.id, result, now),
                effects,
            },
            Err(message) => {
                log::warn!("Command {} failed: {}", command.id, message);
                Handled {
                    ack: Ack::failure(&command.id, message, now),
                    effects: Effects::default(),
                }
            }
        };
        self.recent.remember(&handled.ack);
        handled
    }

    fn dispatch(&self, command: &Command, host: &mut dyn CommandHost) -> HandlerResult {
        let p = &command.params;
        let changed = Effects {
            state_changed: true,
            restart: false,
        };
        match command.action {
            Action::Relay => {
                let pin = self.pin(p)?;
                if !self.config.relay_pins.contains(&pin) {
                    return Err(format!("pin {} is not a relay output", pin));
                }
                let high = level(p)?;
                host.io().set_output(pin, high).map_err(|e| e.to_string())?;
                Ok((None, changed))
            }
            Action::DigitalWrite => {
                let pin = self.pin(p)?;
                let high = level(p)?;
                host.io().set_output(pin, high).map_err(|e| e.to_string())?;
                Ok((None, changed))
            }
            Action::Pwm | Action::AnalogWrite => {
                let pin = self.pin(p)?;
                let value = p.value.ok_or_else(|| missing("value"))?;
                let duty = u8::try_from(value)
                    .ok()
                    .filter(|v| *v <= self.config.pwm_max)
                    .ok_or_else(|| {
                        format!("value {} out of range 0..={}", value, self.config.pwm_max)
                    })?;
                host.io().set_pwm(pin, duty).map_err(|e| e.to_string())?;
                Ok((None, changed))
            }
            Action::DigitalRead => {
                let pin = self.pin(p)?;
                let high = host.io().read_digital(pin).map_err(|e| e.to_string())?;
                Ok((Some(json!({ "pin": pin, "value": u8::from(high) })), Effects::default()))
            }
            Action::AnalogRead => {
                let pin = self.pin(p)?;
                let value = host.io().read_analog(pin).map_err(|e| e.to_string())?;
                Ok((Some(json!({ "pin": pin, "value": value })), Effects::default()))
            }
            Action::Restart => Ok((
                None,
                Effects {
                    state_changed: false,
                    restart: true,
                },
            )),
            Action::StatusRequest => Ok((Some(host.status_report()), Effects::default())),
            Action::OtaUpdate => {
                let url = p.source_url.as_deref().ok_or_else(|| missing("url"))?;
                let digest = p.expected_digest.as_deref().ok_or_else(|| missing("checksum"))?;
                host.request_update(url, digest).map_err(|e| e.to_string())?;
                Ok((Some(json!({ "state": "requested" })), Effects::default()))
            }
        }
    }

    fn pin(&self, p: &Params) -> Result<u8, String> {
        let pin = p.pin.ok_or_else(|| missing("pin"))?;
        u8::try_from(pin)
            .ok()
            .filter(|pin| *pin <= self.config.max_pin)
            .ok_or_else(|| format!("invalid pin {}", pin))
    }
}

fn missing(field: &'static str) -> String {
    ProtocolError::MissingField(field).to_string()
}

/// `state` accepts booleans, numbers and the usual on/off strings.
fn level(p: &Params) -> Result<bool, String> {
    match p.state.as_ref().ok_or_else(|| missing("state"))? {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "on" | "high" | "true" | "1" => Ok(true),
            "off" | "low" | "false" | "0" => Ok(false),
            other => Err(ProtocolError::InvalidParameter(format!("invalid state {:?}", other)).to_string()),
        },
        other => Err(ProtocolError::InvalidParameter(format!("invalid state {}", other)).to_string()),
    }
}
