// End-to-end scenarios driving DeviceRuntime against in-memory fakes

pub(crate) mod fakes;

mod connectivity_scenarios;
mod ota_scenarios;

use core::time::Duration;

use serde_json::Value;

use crate::config::{CoreConfig, DeviceIdentity};
use crate::runtime::{DeviceRuntime, RebootReason};
use fakes::{DualBankFlash, ImageServer, SimBoard, SimNet};

pub(crate) const CMD: &str = "saphari/acme/devices/pump-7/cmd";
pub(crate) const ACK: &str = "saphari/acme/devices/pump-7/ack";
pub(crate) const PRESENCE: &str = "saphari/acme/devices/pump-7/status";
pub(crate) const STATE: &str = "saphari/acme/devices/pump-7/state";
pub(crate) const OTA_STATUS: &str = "saphari/acme/devices/pump-7/ota_status";

type Runtime = DeviceRuntime<SimNet, DualBankFlash, ImageServer, SimBoard>;

/// One simulated device plus the world around it. Survives reboots: the
/// runtime is rebuilt, the broker, flash and board persist.
pub(crate) struct Device {
    pub net: SimNet,
    pub flash: DualBankFlash,
    pub server: ImageServer,
    pub board: SimBoard,
    pub runtime: Runtime,
    pub now: Duration,
    pub config: CoreConfig,
}

impl Device {
    pub fn boot() -> Self {
        Self::boot_with(CoreConfig::default())
    }

    pub fn boot_with(config: CoreConfig) -> Self {
        let net = SimNet::new();
        let flash = DualBankFlash::new(b"firmware-v1");
        let server = ImageServer::new();
        let board = SimBoard::new();
        let runtime = Self::start(&net, &flash, &server, &board, &config);
        Self {
            net,
            flash,
            server,
            board,
            runtime,
            now: Duration::ZERO,
            config,
        }
    }

    fn start(
        net: &SimNet,
        flash: &DualBankFlash,
        server: &ImageServer,
        board: &SimBoard,
        config: &CoreConfig,
    ) -> Runtime {
        DeviceRuntime::new(
            DeviceIdentity::new("acme", "pump-7", "s3cret-key"),
            config.clone(),
            net.clone(),
            flash.clone(),
            server.clone(),
            board.clone(),
            Duration::ZERO,
        )
        .unwrap()
    }

    /// Restart: the broker sees the client vanish, the bootloader picks the
    /// next image, uptime starts over.
    pub fn reboot(&mut self) {
        self.net.crash_device();
        self.flash.reboot();
        self.now = Duration::ZERO;
        self.runtime = Self::start(&self.net, &self.flash, &self.server, &self.board, &self.config);
    }

    pub fn tick(&mut self) -> Option<RebootReason> {
        let outcome = self.runtime.tick(self.now);
        self.now += Duration::from_millis(100);
        outcome.reboot
    }

    /// Tick for up to `secs` seconds, stopping at the first reboot request.
    pub fn run_for(&mut self, secs: u64) -> Option<RebootReason> {
        for _ in 0..secs * 10 {
            if let Some(reason) = self.tick() {
                return Some(reason);
            }
        }
        None
    }

    pub fn connect(&mut self) {
        for _ in 0..50 {
            self.tick();
            if self.runtime.supervisor().is_connected() {
                return;
            }
        }
        panic!("device did not connect");
    }

    pub fn send(&self, payload: &str) {
        assert!(self.net.send_to_device(CMD, payload), "command not delivered");
    }

    pub fn acks(&self) -> Vec<Value> {
        self.json_on(ACK)
    }

    pub fn ota_status(&self) -> Vec<Value> {
        self.json_on(OTA_STATUS)
    }

    pub fn presence(&self) -> Option<String> {
        self.net
            .retained(PRESENCE)
            .map(|p| String::from_utf8_lossy(&p).into_owned())
    }

    fn json_on(&self, topic: &str) -> Vec<Value> {
        self.net
            .published(topic)
            .iter()
            .map(|p| serde_json::from_slice(&p.payload).unwrap())
            .collect()
    }
}
