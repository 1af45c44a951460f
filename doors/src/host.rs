use std::{convert::Infallible, net::Ipv4Addr, time::Duration};

use anyhow::Context;
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, Incoming, MqttOptions, QoS,
};
use tracing::{info, warn};

use garage_doors_common::{
    Bridge, BridgeConfig, BridgeParts, BrokerConfig, BrokerTransport, CredentialStore, DoorId,
    DoorInputs, InboundMessage, PlainSecrets, SystemControl, ThreadSleep, TransportError,
    UpdateHandler, UpdateService, WifiLink,
};

const HOST_SECRET_KEY: &str = "host-simulation";
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_POLL_SLICE: Duration = Duration::from_millis(10);
const MQTT_MAX_EVENTS_PER_POLL: usize = 32;

// Mirrors the status codes the device-side client reports.
const MQTT_CONNECTION_TIMEOUT: i32 = -4;
const MQTT_CONNECTION_LOST: i32 = -3;
const MQTT_CONNECT_FAILED: i32 = -2;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("garage door bridge {} (host)", env!("CARGO_PKG_VERSION"));

    if cfg!(feature = "generate-encrypted-config") {
        let key = std::env::var("GARAGE_KEY").unwrap_or_else(|_| HOST_SECRET_KEY.to_string());
        CredentialStore::log_encrypted_config(&key, &plain_secrets_from_env().as_plain());
    }

    let config = load_config()?;

    let mut bridge = Bridge::new(
        &config,
        BridgeParts {
            link: LoopbackLink,
            system: ProcessControl,
            transport: RumqttTransport::new(&config.broker),
            updater: HostUpdater,
            doors: SimulatedDoors::default(),
            sleeper: ThreadSleep,
        },
    );

    bridge.start().context("network startup failed")?;
    bridge.run()
}

struct EnvSecrets {
    wifi_ssid: String,
    wifi_pass: String,
    mqtt_user: String,
    mqtt_pass: String,
}

impl EnvSecrets {
    fn as_plain(&self) -> PlainSecrets<'_> {
        PlainSecrets {
            wifi_ssid: &self.wifi_ssid,
            wifi_pass: &self.wifi_pass,
            mqtt_user: &self.mqtt_user,
            mqtt_pass: &self.mqtt_pass,
        }
    }
}

fn plain_secrets_from_env() -> EnvSecrets {
    let var = |name: &str| std::env::var(name).unwrap_or_default();
    EnvSecrets {
        wifi_ssid: std::env::var("WIFI_SSID").unwrap_or_else(|_| "loopback".to_string()),
        wifi_pass: var("WIFI_PASS"),
        mqtt_user: var("MQTT_USER"),
        mqtt_pass: var("MQTT_PASS"),
    }
}

fn load_config() -> anyhow::Result<BridgeConfig> {
    let mut config = match std::env::var("GARAGE_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            BridgeConfig::from_json(&raw).with_context(|| format!("invalid config file {path}"))?
        }
        Err(_) => BridgeConfig {
            broker: BrokerConfig {
                host: "127.0.0.1".to_string(),
                ..BrokerConfig::default()
            },
            ..BridgeConfig::default()
        },
    };

    apply_env_overrides(
        &mut config,
        std::env::var("MQTT_HOST").ok(),
        std::env::var("MQTT_PORT").ok(),
    );

    // Seal plaintext from the environment when no sealed secrets were supplied.
    if config.secrets.key.is_empty() {
        config.secrets =
            CredentialStore::seal_all(HOST_SECRET_KEY, &plain_secrets_from_env().as_plain());
    }

    config.sanitize();
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut BridgeConfig, host: Option<String>, port: Option<String>) {
    if let Some(host) = host.filter(|value| !value.trim().is_empty()) {
        config.broker.host = host;
    }
    if let Some(port) = port.and_then(|value| value.parse::<u16>().ok()) {
        config.broker.port = port;
    }
}

struct LoopbackLink;

impl WifiLink for LoopbackLink {
    fn connect_and_wait(&mut self, ssid: &str, _password: &str, _wait: Duration) -> bool {
        info!("simulated network `{ssid}` is always up");
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::LOCALHOST)
    }
}

/// The host has no device to reboot; exiting lets a supervisor restart us.
struct ProcessControl;

impl SystemControl for ProcessControl {
    fn restart(&mut self) {
        warn!("restart requested; exiting");
        std::process::exit(1);
    }
}

struct HostUpdater;

impl UpdateService for HostUpdater {
    type Error = Infallible;

    fn begin(&mut self) -> Result<(), Self::Error> {
        info!("remote updates are not supported on the host build");
        Ok(())
    }

    fn handle(&mut self, _handler: &mut dyn UpdateHandler) {}
}

/// Door 1 toggles every 10 polls and door 2 every 25.
#[derive(Default)]
struct SimulatedDoors {
    tick: u64,
}

impl SimulatedDoors {
    fn level(tick: u64, period: u64) -> bool {
        (tick / period) % 2 == 1
    }
}

impl DoorInputs for SimulatedDoors {
    fn is_high(&mut self, door: DoorId) -> bool {
        match door {
            DoorId::One => {
                self.tick = self.tick.saturating_add(1);
                Self::level(self.tick, 10)
            }
            DoorId::Two => Self::level(self.tick, 25),
        }
    }
}

struct RumqttTransport {
    host: String,
    port: u16,
    session: Option<(Client, Connection)>,
    connected: bool,
}

impl RumqttTransport {
    fn new(broker: &BrokerConfig) -> Self {
        Self {
            host: broker.host.clone(),
            port: broker.port,
            session: None,
            connected: false,
        }
    }
}

fn connack_code(code: ConnectReturnCode) -> i32 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

fn connection_error_code(err: &ConnectionError) -> i32 {
    match err {
        ConnectionError::ConnectionRefused(code) => connack_code(*code),
        ConnectionError::NetworkTimeout => MQTT_CONNECTION_TIMEOUT,
        _ => MQTT_CONNECT_FAILED,
    }
}

impl BrokerTransport for RumqttTransport {
    fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), TransportError> {
        self.session = None;
        self.connected = false;

        let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
        options.set_keep_alive(Duration::from_secs(15));
        if !username.is_empty() {
            options.set_credentials(username, password);
        }

        let (client, mut connection) = Client::new(options, 32);
        loop {
            match connection.recv_timeout(MQTT_CONNECT_TIMEOUT) {
                Ok(Ok(Event::Incoming(Incoming::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::new(connack_code(ack.code)));
                    }
                    self.session = Some((client, connection));
                    self.connected = true;
                    return Ok(());
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!("mqtt connect error: {err}");
                    return Err(TransportError::new(connection_error_code(&err)));
                }
                Err(_) => return Err(TransportError::new(MQTT_CONNECTION_TIMEOUT)),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let Some((client, _)) = self.session.as_mut() else {
            return Err(TransportError::new(MQTT_CONNECTION_LOST));
        };
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| {
                warn!("mqtt publish rejected: {err}");
                TransportError::new(MQTT_CONNECTION_LOST)
            })
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        let mut inbound = Vec::new();
        let Some((_, connection)) = self.session.as_mut() else {
            return inbound;
        };

        for _ in 0..MQTT_MAX_EVENTS_PER_POLL {
            match connection.recv_timeout(MQTT_POLL_SLICE) {
                Ok(Ok(Event::Incoming(Incoming::Publish(message)))) => {
                    inbound.push(InboundMessage {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    });
                }
                Ok(Ok(Event::Incoming(Incoming::Disconnect))) => {
                    self.connected = false;
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!("mqtt poll error: {err}");
                    self.connected = false;
                    break;
                }
                Err(_) => break,
            }
        }

        if !self.connected {
            self.session = None;
        }
        inbound
    }
}
