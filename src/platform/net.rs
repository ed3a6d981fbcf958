// WiFi station + TLS MQTT client behind the core Transport trait

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::Duration;

use anyhow::Result;
use device_core::transport::{
    InboundMessage, InboundQueue, SessionOptions, SessionProgress, Transport,
};
use device_core::TransportError;
use embedded_svc::mqtt::client::{Details, EventPayload, QoS};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::mqtt::client::{EspMqttClient, LwtConfiguration, MqttClientConfiguration};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};

use crate::config::FirmwareConfig;

const NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

/// What the MQTT event callback hands over to the device loop
enum MqttSignal {
    Connected,
    Disconnected,
    Error(String),
    Message(InboundMessage),
}

pub struct WifiMqttTransport {
    wifi: EspWifi<'static>,
    broker_url: String,
    client: Option<EspMqttClient<'static>>,
    events: Option<Receiver<MqttSignal>>,
    backlog: VecDeque<InboundMessage>,
    connected: bool,
    handshake_failure: Option<TransportError>,
    power_save_off: bool,
}

impl WifiMqttTransport {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        config: &FirmwareConfig,
    ) -> Result<Self> {
        log::info!("Initializing WiFi for SSID: '{}'", config.wifi_ssid);

        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs))?;
        let password = config.wifi_password.as_str();
        let cfg = Configuration::Client(ClientConfiguration {
            ssid: config
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid SSID format: {}", config.wifi_ssid))?,
            password: password
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid password format"))?,
            auth_method: if password.is_empty() {
                log::warn!("WiFi password is empty, using open network");
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });
        wifi.set_configuration(&cfg)?;

        Ok(Self {
            wifi,
            broker_url: config.broker_url(),
            client: None,
            events: None,
            backlog: VecDeque::new(),
            connected: false,
            handshake_failure: None,
            power_save_off: false,
        })
    }

    /// Drain the callback channel into local state.
    fn pump(&mut self) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        loop {
            match events.try_recv() {
                Ok(MqttSignal::Connected) => {
                    self.connected = true;
                    self.handshake_failure = None;
                }
                Ok(MqttSignal::Disconnected) => {
                    if !self.connected && self.handshake_failure.is_none() {
                        // Brokers close the socket on a rejected credential
                        self.handshake_failure = Some(TransportError::Auth(
                            "broker closed the connection during handshake".into(),
                        ));
                    }
                    self.connected = false;
                }
                Ok(MqttSignal::Error(e)) => {
                    log::warn!("MQTT error: {}", e);
                    if !self.connected {
                        self.handshake_failure = Some(TransportError::Io(e));
                    }
                }
                Ok(MqttSignal::Message(message)) => self.backlog.push_back(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.connected = false;
                    break;
                }
            }
        }
    }

    fn disable_power_save(&mut self) {
        if self.power_save_off {
            return;
        }
        let result = unsafe { esp_idf_sys::esp_wifi_set_ps(esp_idf_sys::wifi_ps_type_t_WIFI_PS_NONE) };
        if result == esp_idf_sys::ESP_OK {
            log::info!("WiFi power save disabled");
            self.power_save_off = true;
        } else {
            log::warn!("Failed to disable WiFi power save: {}", result);
        }
    }
}

fn forward(tx: &Sender<MqttSignal>, payload: EventPayload<'_, esp_idf_sys::EspError>) {
    let signal = match payload {
        EventPayload::Connected(_) => MqttSignal::Connected,
        EventPayload::Disconnected => MqttSignal::Disconnected,
        EventPayload::Error(e) => MqttSignal::Error(e.to_string()),
        EventPayload::Received {
            topic,
            data,
            details,
            ..
        } => {
            if !matches!(details, Details::Complete) {
                log::warn!("Dropping chunked MQTT message ({} bytes)", data.len());
                return;
            }
            MqttSignal::Message(InboundMessage {
                topic: topic.unwrap_or_default().to_string(),
                payload: data.to_vec(),
            })
        }
        _ => return,
    };
    // The receiver is gone once the session is torn down
    let _ = tx.send(signal);
}

fn io_err(e: esp_idf_sys::EspError) -> TransportError {
    TransportError::Io(e.to_string())
}

impl Transport for WifiMqttTransport {
    fn begin_link(&mut self) -> Result<(), TransportError> {
        if !self.wifi.is_started().map_err(io_err)? {
            self.wifi.start().map_err(io_err)?;
        } else {
            let _ = self.wifi.disconnect();
        }
        self.power_save_off = false;
        self.wifi.connect().map_err(io_err)
    }

    fn link_up(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn begin_session(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        self.teardown();
        self.disable_power_save();

        let will = &options.last_will;
        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id.as_str()),
            username: Some(options.username.as_str()),
            password: Some(options.password.as_str()),
            keep_alive_interval: Some(Duration::from_secs(options.keep_alive_secs.into())),
            network_timeout: NETWORK_TIMEOUT,
            lwt: Some(LwtConfiguration {
                topic: will.topic.as_str(),
                payload: will.payload.as_slice(),
                qos: QoS::AtLeastOnce,
                retain: will.retain,
            }),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        };

        let (tx, rx) = mpsc::channel();
        log::info!("Opening MQTT session to {}", self.broker_url);
        let client = EspMqttClient::new_cb(&self.broker_url, &conf, move |event| {
            forward(&tx, event.payload())
        })
        .map_err(io_err)?;

        self.client = Some(client);
        self.events = Some(rx);
        self.connected = false;
        self.handshake_failure = None;
        Ok(())
    }

    fn poll_session(&mut self) -> SessionProgress {
        self.pump();
        if self.connected {
            SessionProgress::Established
        } else if let Some(e) = self.handshake_failure.take() {
            SessionProgress::Failed(e)
        } else {
            SessionProgress::Pending
        }
    }

    fn session_alive(&self) -> bool {
        self.client.is_some() && self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client.subscribe(topic, QoS::AtLeastOnce).map_err(io_err)?;
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(io_err)?;
        Ok(())
    }

    fn drain_into(&mut self, inbox: &mut InboundQueue) -> usize {
        self.pump();
        let moved = self.backlog.len().min(inbox.remaining());
        for message in self.backlog.drain(..moved) {
            inbox.push(message);
        }
        moved
    }

    fn teardown(&mut self) {
        // Dropping the client stops it with a DISCONNECT, so the broker drops
        // the will; offline was already published by the supervisor
        if self.client.take().is_some() {
            log::info!("MQTT session torn down");
        }
        self.events = None;
        self.connected = false;
        self.backlog.clear();
    }
}
