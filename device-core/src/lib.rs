//! Device Core - connectivity, command and firmware-update logic for the SapHari device
//!
//! This crate contains everything that decides *what* the device does on the wire.
//! It never touches ESP-IDF directly: the radio, the broker session, flash banks,
//! the HTTPS image download and the GPIO pins are reached through the traits in
//! [`transport`], [`ota`], and [`command`], so all of it runs and tests on the host.
//!
//! One [`runtime::DeviceRuntime`] owns every component and is driven by a single
//! cooperative loop calling [`runtime::DeviceRuntime::tick`].

pub mod backoff;
pub mod command;
pub mod config;
pub mod error;
pub mod health;
pub mod ota;
pub mod presence;
pub mod runtime;
pub mod supervisor;
pub mod token;
pub mod topics;
pub mod transport;

pub use config::{CoreConfig, DeviceIdentity};
pub use error::{CoreError, TransportError};
pub use runtime::{DeviceRuntime, RebootReason, TickOutcome};
pub use supervisor::{ConnectionState, ConnectivitySupervisor};

#[cfg(test)]
mod tests;
