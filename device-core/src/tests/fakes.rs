//! In-memory stand-ins for the radio/broker, flash banks, image server and
//! board. Each is a cheap `Rc` handle so a test keeps a clone for inspection
//! while the runtime owns another.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use crate::command::IoCapabilities;
use crate::error::{IoError, TransportError};
use crate::health::SystemProbe;
use crate::ota::{Chunk, DownloadError, FirmwareStore, ImageSource, ImageState, OtaError};
use crate::transport::{
    InboundMessage, InboundQueue, LastWill, SessionOptions, SessionProgress, Transport,
};

// ---------------------------------------------------------------------------
// Radio link + broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    Idle,
    Connecting,
    Up,
    /// Library noticed the socket died.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NetEvent {
    WillArmed,
    Published(String),
}

#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

struct NetState {
    link_available: bool,
    link_started: bool,
    link_attempts: u32,
    session: Session,
    refuse_next: Option<TransportError>,
    refuse_all: bool,
    fail_publishes: bool,
    /// Teardown sends DISCONNECT, so the broker discards the will.
    clean_teardown: bool,
    will: Option<LastWill>,
    last_options: Option<SessionOptions>,
    subscriptions: Vec<String>,
    retained: HashMap<String, Vec<u8>>,
    log: Vec<Published>,
    events: Vec<NetEvent>,
    to_device: VecDeque<InboundMessage>,
    teardowns: u32,
}

impl NetState {
    fn broker_publish(&mut self, topic: &str, payload: &[u8], retain: bool) {
        if retain {
            self.retained.insert(topic.to_string(), payload.to_vec());
        }
        self.events.push(NetEvent::Published(topic.to_string()));
        self.log.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
    }

    /// Broker noticed the client vanished without a clean disconnect.
    fn fire_will(&mut self) {
        if let Some(will) = self.will.take() {
            self.broker_publish(&will.topic, &will.payload, will.retain);
        }
    }

    fn link_up(&self) -> bool {
        self.link_started && self.link_available
    }
}

#[derive(Clone)]
pub struct SimNet(Rc<RefCell<NetState>>);

impl SimNet {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(NetState {
            link_available: true,
            link_started: false,
            link_attempts: 0,
            session: Session::Idle,
            refuse_next: None,
            refuse_all: false,
            fail_publishes: false,
            clean_teardown: false,
            will: None,
            last_options: None,
            subscriptions: Vec::new(),
            retained: HashMap::new(),
            log: Vec::new(),
            events: Vec::new(),
            to_device: VecDeque::new(),
            teardowns: 0,
        })))
    }

    pub fn set_link_available(&self, available: bool) {
        let mut net = self.0.borrow_mut();
        net.link_available = available;
        if !available && net.session == Session::Up {
            net.fire_will();
            net.session = Session::Lost;
        }
    }

    pub fn link_attempts(&self) -> u32 {
        self.0.borrow().link_attempts
    }

    pub fn refuse_next_session(&self, error: TransportError) {
        self.0.borrow_mut().refuse_next = Some(error);
    }

    pub fn refuse_all_sessions(&self, refuse: bool) {
        self.0.borrow_mut().refuse_all = refuse;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.0.borrow_mut().fail_publishes = fail;
    }

    pub fn clean_teardown(&self, clean: bool) {
        self.0.borrow_mut().clean_teardown = clean;
    }

    /// Messages the broker has delivered that the device has not pulled yet.
    pub fn undelivered(&self) -> usize {
        self.0.borrow().to_device.len()
    }

    /// The library reports the session gone; the broker fires the will.
    pub fn drop_session(&self) {
        let mut net = self.0.borrow_mut();
        net.fire_will();
        net.session = Session::Lost;
    }

    /// Power loss on the device side.
    pub fn crash_device(&self) {
        let mut net = self.0.borrow_mut();
        net.fire_will();
        net.session = Session::Idle;
        net.link_started = false;
        net.subscriptions.clear();
        net.to_device.clear();
    }

    /// Deliver a message from the broker if the device is subscribed.
    pub fn send_to_device(&self, topic: &str, payload: &str) -> bool {
        let mut net = self.0.borrow_mut();
        if net.session != Session::Up || !net.subscriptions.iter().any(|s| s == topic) {
            return false;
        }
        net.to_device.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
        true
    }

    /// Deliver regardless of subscriptions.
    pub fn inject_raw(&self, topic: &str, payload: &str) {
        self.0.borrow_mut().to_device.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    pub fn registered_will(&self) -> Option<LastWill> {
        self.0.borrow().last_options.as_ref().map(|o| o.last_will.clone())
    }

    pub fn last_session_options(&self) -> Option<SessionOptions> {
        self.0.borrow().last_options.clone()
    }

    /// Whether a will was armed before the first publish to `topic`.
    pub fn will_armed_before_publish(&self, topic: &str) -> Option<bool> {
        let net = self.0.borrow();
        let publish = net
            .events
            .iter()
            .position(|e| *e == NetEvent::Published(topic.to_string()))?;
        Some(net.events[..publish].contains(&NetEvent::WillArmed))
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.0.borrow().retained.get(topic).cloned()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.0.borrow().subscriptions.iter().any(|s| s == topic)
    }

    pub fn published(&self, topic: &str) -> Vec<Published> {
        self.0
            .borrow()
            .log
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn published_count(&self, topic: &str) -> usize {
        self.published(topic).len()
    }

    pub fn teardown_count(&self) -> u32 {
        self.0.borrow().teardowns
    }
}

impl Transport for SimNet {
    fn begin_link(&mut self) -> Result<(), TransportError> {
        let mut net = self.0.borrow_mut();
        net.link_attempts += 1;
        net.link_started = true;
        Ok(())
    }

    fn link_up(&self) -> bool {
        self.0.borrow().link_up()
    }

    fn begin_session(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        let mut net = self.0.borrow_mut();
        if !net.link_up() {
            return Err(TransportError::LinkDown);
        }
        net.last_options = Some(options.clone());
        net.session = Session::Connecting;
        Ok(())
    }

    fn poll_session(&mut self) -> SessionProgress {
        let mut net = self.0.borrow_mut();
        if net.session != Session::Connecting {
            return SessionProgress::Failed(TransportError::NotConnected);
        }
        let refusal = match net.refuse_next.take() {
            Some(error) => Some(error),
            None if net.refuse_all => Some(TransportError::Refused("broker unavailable".into())),
            None => None,
        };
        if let Some(error) = refusal {
            net.session = Session::Idle;
            return SessionProgress::Failed(error);
        }
        net.session = Session::Up;
        net.will = net.last_options.as_ref().map(|o| o.last_will.clone());
        net.events.push(NetEvent::WillArmed);
        SessionProgress::Established
    }

    fn session_alive(&self) -> bool {
        self.0.borrow().session == Session::Up
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut net = self.0.borrow_mut();
        if net.session != Session::Up {
            return Err(TransportError::NotConnected);
        }
        net.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        let mut net = self.0.borrow_mut();
        if net.fail_publishes {
            return Err(TransportError::Io("send failed".into()));
        }
        if net.session != Session::Up {
            return Err(TransportError::NotConnected);
        }
        net.broker_publish(topic, payload, retain);
        Ok(())
    }

    fn drain_into(&mut self, inbox: &mut InboundQueue) -> usize {
        let mut net = self.0.borrow_mut();
        let mut moved = 0;
        while inbox.remaining() > 0 {
            let Some(message) = net.to_device.pop_front() else {
                break;
            };
            inbox.push(message);
            moved += 1;
        }
        moved
    }

    fn teardown(&mut self) {
        let mut net = self.0.borrow_mut();
        net.teardowns += 1;
        if net.session == Session::Up && !net.clean_teardown {
            net.fire_will();
        }
        net.will = None;
        net.session = Session::Idle;
        net.subscriptions.clear();
    }
}

// ---------------------------------------------------------------------------
// Dual-bank flash
// ---------------------------------------------------------------------------

struct FlashState {
    banks: [Vec<u8>; 2],
    running: usize,
    boot: usize,
    pending_verify: bool,
    reverted: bool,
    staging: Option<Vec<u8>>,
    finished: bool,
}

#[derive(Clone)]
pub struct DualBankFlash(Rc<RefCell<FlashState>>);

impl DualBankFlash {
    pub fn new(image: &[u8]) -> Self {
        Self(Rc::new(RefCell::new(FlashState {
            banks: [image.to_vec(), Vec::new()],
            running: 0,
            boot: 0,
            pending_verify: false,
            reverted: false,
            staging: None,
            finished: false,
        })))
    }

    /// Write `image` to the inactive bank, select it and reboot into it.
    pub fn install_pending(&self, image: &[u8]) {
        {
            let mut flash = self.0.borrow_mut();
            let inactive = 1 - flash.running;
            flash.banks[inactive] = image.to_vec();
            flash.boot = inactive;
        }
        self.reboot();
    }

    /// What the bootloader does on restart.
    pub fn reboot(&self) {
        let mut flash = self.0.borrow_mut();
        flash.staging = None;
        flash.finished = false;
        if flash.pending_verify {
            // Unconfirmed image never survives a restart
            let previous = 1 - flash.running;
            flash.running = previous;
            flash.boot = previous;
            flash.pending_verify = false;
            flash.reverted = true;
        } else if flash.boot != flash.running {
            flash.running = flash.boot;
            flash.pending_verify = true;
        }
    }

    pub fn next_boot_image(&self) -> Vec<u8> {
        let flash = self.0.borrow();
        flash.banks[flash.boot].clone()
    }

    pub fn running_image_bytes(&self) -> Vec<u8> {
        let flash = self.0.borrow();
        flash.banks[flash.running].clone()
    }

    pub fn running_confirmed(&self) -> bool {
        !self.0.borrow().pending_verify
    }
}

impl FirmwareStore for DualBankFlash {
    fn running_image(&mut self) -> ImageState {
        let mut flash = self.0.borrow_mut();
        if flash.pending_verify {
            ImageState::PendingVerify
        } else if std::mem::take(&mut flash.reverted) {
            ImageState::Reverted
        } else {
            ImageState::Valid
        }
    }

    fn begin(&mut self, _size_hint: Option<u64>) -> Result<(), OtaError> {
        let mut flash = self.0.borrow_mut();
        flash.staging = Some(Vec::new());
        flash.finished = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let mut flash = self.0.borrow_mut();
        let staging = flash
            .staging
            .as_mut()
            .ok_or_else(|| OtaError::Store("write without begin".into()))?;
        staging.extend_from_slice(data);
        Ok(())
    }

    fn discard(&mut self) {
        let mut flash = self.0.borrow_mut();
        flash.staging = None;
        flash.finished = false;
    }

    fn finish(&mut self) -> Result<(), OtaError> {
        let mut flash = self.0.borrow_mut();
        if flash.staging.is_none() {
            return Err(OtaError::Store("nothing written".into()));
        }
        flash.finished = true;
        Ok(())
    }

    fn activate(&mut self) -> Result<(), OtaError> {
        let mut flash = self.0.borrow_mut();
        if !flash.finished {
            return Err(OtaError::Store("image not finished".into()));
        }
        let image = flash.staging.take().unwrap_or_default();
        let inactive = 1 - flash.running;
        flash.banks[inactive] = image;
        flash.boot = inactive;
        flash.finished = false;
        Ok(())
    }

    fn mark_valid(&mut self) -> Result<(), OtaError> {
        self.0.borrow_mut().pending_verify = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), OtaError> {
        let mut flash = self.0.borrow_mut();
        let previous = 1 - flash.running;
        if flash.banks[previous].is_empty() {
            return Err(OtaError::Rollback("no previous image".into()));
        }
        flash.boot = previous;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTPS image server
// ---------------------------------------------------------------------------

struct ServerState {
    images: HashMap<String, Vec<u8>>,
    current: Option<(Vec<u8>, usize)>,
    current_stall: Option<usize>,
    stall_next: Option<usize>,
    failing_reads: u32,
    failure: Option<DownloadError>,
    opens: u32,
}

#[derive(Clone)]
pub struct ImageServer(Rc<RefCell<ServerState>>);

impl ImageServer {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(ServerState {
            images: HashMap::new(),
            current: None,
            current_stall: None,
            stall_next: None,
            failing_reads: 0,
            failure: None,
            opens: 0,
        })))
    }

    pub fn host(&self, url: &str, image: Vec<u8>) {
        self.0.borrow_mut().images.insert(url.to_string(), image);
    }

    pub fn fail_next_reads(&self, count: u32, error: DownloadError) {
        let mut server = self.0.borrow_mut();
        server.failing_reads = count;
        server.failure = Some(error);
    }

    /// The next connection goes silent after `bytes`.
    pub fn stall_after(&self, bytes: usize) {
        self.0.borrow_mut().stall_next = Some(bytes);
    }

    pub fn open_count(&self) -> u32 {
        self.0.borrow().opens
    }
}

impl ImageSource for ImageServer {
    fn open(&mut self, url: &str) -> Result<Option<u64>, DownloadError> {
        let mut server = self.0.borrow_mut();
        server.opens += 1;
        let image = server.images.get(url).cloned().ok_or(DownloadError::Http(404))?;
        let len = image.len() as u64;
        server.current = Some((image, 0));
        server.current_stall = server.stall_next.take();
        Ok(Some(len))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Chunk, DownloadError> {
        let mut server = self.0.borrow_mut();
        if server.failing_reads > 0 {
            server.failing_reads -= 1;
            return Err(server.failure.clone().unwrap_or(DownloadError::Reset));
        }
        let stall = server.current_stall;
        let Some((image, pos)) = server.current.as_mut() else {
            return Err(DownloadError::Io("not open".into()));
        };
        let limit = stall.unwrap_or(usize::MAX).min(image.len());
        if *pos >= image.len() {
            return Ok(Chunk::Done);
        }
        if *pos >= limit {
            return Ok(Chunk::Pending);
        }
        let n = buf.len().min(limit - *pos);
        buf[..n].copy_from_slice(&image[*pos..*pos + n]);
        *pos += n;
        Ok(Chunk::Data(n))
    }

    fn close(&mut self) {
        let mut server = self.0.borrow_mut();
        server.current = None;
        server.current_stall = None;
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

struct BoardState {
    outputs: BTreeMap<u8, u16>,
    writes: u32,
    free_heap: u32,
    rssi: Option<i8>,
}

#[derive(Clone)]
pub struct SimBoard(Rc<RefCell<BoardState>>);

impl SimBoard {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(BoardState {
            outputs: BTreeMap::new(),
            writes: 0,
            free_heap: 150_000,
            rssi: Some(-60),
        })))
    }

    pub fn set_free_heap(&self, bytes: u32) {
        self.0.borrow_mut().free_heap = bytes;
    }

    pub fn set_rssi(&self, rssi: Option<i8>) {
        self.0.borrow_mut().rssi = rssi;
    }

    pub fn writes(&self) -> u32 {
        self.0.borrow().writes
    }

    pub fn output(&self, pin: u8) -> Option<u16> {
        self.0.borrow().outputs.get(&pin).copied()
    }
}

impl IoCapabilities for SimBoard {
    fn set_output(&mut self, pin: u8, high: bool) -> Result<(), IoError> {
        let mut board = self.0.borrow_mut();
        board.writes += 1;
        board.outputs.insert(pin, u16::from(high));
        Ok(())
    }

    fn set_pwm(&mut self, pin: u8, duty: u8) -> Result<(), IoError> {
        let mut board = self.0.borrow_mut();
        board.writes += 1;
        board.outputs.insert(pin, u16::from(duty));
        Ok(())
    }

    fn read_digital(&mut self, pin: u8) -> Result<bool, IoError> {
        Ok(self.0.borrow().outputs.get(&pin).is_some_and(|v| *v != 0))
    }

    fn read_analog(&mut self, pin: u8) -> Result<u16, IoError> {
        if !(32..=39).contains(&pin) {
            return Err(IoError::UnsupportedPin(pin));
        }
        Ok(1234)
    }

    fn pin_states(&self) -> Vec<(u8, u16)> {
        self.0.borrow().outputs.iter().map(|(p, v)| (*p, *v)).collect()
    }
}

impl SystemProbe for SimBoard {
    fn free_heap(&self) -> u32 {
        self.0.borrow().free_heap
    }

    fn rssi_dbm(&self) -> Option<i8> {
        self.0.borrow().rssi
    }
}
