use core::fmt::Write as _;
use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, IOPin, Input, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{Details, EspMqttClient, EventPayload, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use sha2::{Digest, Sha256};

use garage_doors_common::{
    Bridge, BridgeConfig, BridgeParts, BrokerConfig, BrokerTransport, DoorId, DoorInputs,
    InboundMessage, SecretsConfig, Sleep, SystemControl, TransportError, UpdateError,
    UpdateHandler, UpdateJournal, UpdateService, WifiLink,
};

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_POLL_MS: u64 = 250;

const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_CONNECTION_TIMEOUT: i32 = -4;
const MQTT_CONNECTION_LOST: i32 = -3;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const MAX_QUEUED_MESSAGES: usize = 16;

const OTA_PORT: u16 = 3232;
const OTA_ROUTE: &str = "/api/ota/apply";
const OTA_PASSWORD_HEADER: &str = "X-OTA-Password";
const OTA_SHA256_HEADER: &str = "X-OTA-SHA256";
const OTA_CHUNK_SIZE: usize = 4096;
const OTA_HTTP_STACK_SIZE: usize = 16 * 1024;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    info!("garage door sensors {}", env!("CARGO_PKG_VERSION"));

    #[cfg(feature = "generate-encrypted-config")]
    log_encrypted_config();

    let config = build_config();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let doors = GpioDoors::new(pins.gpio5.downgrade(), pins.gpio4.downgrade())
        .context("failed to configure door inputs")?;
    let link = EspLink::new(modem, sys_loop, nvs_partition).context("wifi init failed")?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    arm_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let updater = HttpOtaListener::new(&config.ota_password);

    let mut bridge = Bridge::new(
        &config,
        BridgeParts {
            link,
            system: EspSystem,
            transport: EspMqttTransport::new(&config.broker),
            updater,
            doors,
            sleeper: WatchdogSleep,
        },
    );

    bridge.start().context("network startup failed")?;
    bridge.run()
}

fn build_config() -> BridgeConfig {
    let mut config = BridgeConfig {
        secrets: SecretsConfig {
            key: option_env!("GARAGE_KEY").unwrap_or_default().to_string(),
            wifi_ssid: option_env!("GARAGE_WIFI_SSID").unwrap_or_default().to_string(),
            wifi_pass: option_env!("GARAGE_WIFI_PASS").unwrap_or_default().to_string(),
            mqtt_user: option_env!("GARAGE_MQTT_USER").unwrap_or_default().to_string(),
            mqtt_pass: option_env!("GARAGE_MQTT_PASS").unwrap_or_default().to_string(),
        },
        ota_password: option_env!("OTA_PASSWORD").unwrap_or_default().to_string(),
        ..BridgeConfig::default()
    };
    if let Some(host) = option_env!("MQTT_SERVER") {
        config.broker.host = host.to_string();
    }
    if let Some(port) = option_env!("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.broker.port = port;
    }
    config.sanitize();
    config
}

#[cfg(feature = "generate-encrypted-config")]
fn log_encrypted_config() {
    use garage_doors_common::{CredentialStore, PlainSecrets};

    CredentialStore::log_encrypted_config(
        option_env!("GARAGE_KEY").unwrap_or_default(),
        &PlainSecrets {
            wifi_ssid: option_env!("WIFI_SSID").unwrap_or_default(),
            wifi_pass: option_env!("WIFI_PASS").unwrap_or_default(),
            mqtt_user: option_env!("MQTT_USER").unwrap_or_default(),
            mqtt_pass: option_env!("MQTT_PASS").unwrap_or_default(),
        },
    );
}

struct GpioDoors {
    door_1: PinDriver<'static, AnyIOPin, Input>,
    door_2: PinDriver<'static, AnyIOPin, Input>,
}

impl GpioDoors {
    fn new(door_1: AnyIOPin, door_2: AnyIOPin) -> anyhow::Result<Self> {
        let mut door_1 = PinDriver::input(door_1)?;
        door_1.set_pull(Pull::Up)?;
        let mut door_2 = PinDriver::input(door_2)?;
        door_2.set_pull(Pull::Up)?;
        Ok(Self { door_1, door_2 })
    }
}

impl DoorInputs for GpioDoors {
    fn is_high(&mut self, door: DoorId) -> bool {
        match door {
            DoorId::One => self.door_1.is_high(),
            DoorId::Two => self.door_2.is_high(),
        }
    }
}

struct EspLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        Ok(Self { wifi })
    }

    fn try_connect(&mut self, ssid: &str, password: &str, wait: Duration) -> anyhow::Result<bool> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;

        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        disable_wifi_power_save();
        self.wifi.wifi_mut().connect()?;

        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            feed_watchdog();
            if self.wifi.is_up()? {
                return Ok(true);
            }
            thread::sleep(Duration::from_millis(WIFI_POLL_MS));
        }

        let _ = self.wifi.wifi_mut().disconnect();
        Ok(false)
    }
}

impl WifiLink for EspLink {
    fn connect_and_wait(&mut self, ssid: &str, password: &str, wait: Duration) -> bool {
        match self.try_connect(ssid, password, wait) {
            Ok(up) => up,
            Err(err) => {
                warn!("wifi connect failed: {err:#}");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
    }
}

struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

/// Sleeps in one-second slices so long pauses keep the task watchdog fed.
struct WatchdogSleep;

impl Sleep for WatchdogSleep {
    fn sleep(&mut self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() {
            feed_watchdog();
            let slice = remaining.min(Duration::from_secs(1));
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        feed_watchdog();
    }
}

#[derive(Default)]
struct MqttInbox {
    connected: bool,
    last_error: Option<i32>,
    messages: VecDeque<InboundMessage>,
}

fn record_mqtt_event(inbox: &Mutex<MqttInbox>, payload: EventPayload<'_, EspError>) {
    let Ok(mut inbox) = inbox.lock() else {
        return;
    };
    match payload {
        EventPayload::Connected(_) => {
            inbox.connected = true;
            inbox.last_error = None;
        }
        EventPayload::Disconnected => inbox.connected = false,
        EventPayload::Received {
            topic,
            data,
            details,
            ..
        } => {
            // Only whole payloads are queued.
            if !matches!(details, Details::Complete) || data.len() > MAX_MQTT_PAYLOAD_BYTES {
                return;
            }
            if inbox.messages.len() >= MAX_QUEUED_MESSAGES {
                inbox.messages.pop_front();
            }
            inbox.messages.push_back(InboundMessage {
                topic: topic.unwrap_or_default().to_string(),
                payload: data.to_vec(),
            });
        }
        EventPayload::Error(err) => inbox.last_error = Some(err.code()),
        _ => {}
    }
}

struct EspMqttTransport {
    url: String,
    client: Option<EspMqttClient<'static>>,
    inbox: Arc<Mutex<MqttInbox>>,
}

impl EspMqttTransport {
    fn new(broker: &BrokerConfig) -> Self {
        Self {
            url: format!("mqtt://{}:{}", broker.host, broker.port),
            client: None,
            inbox: Arc::new(Mutex::new(MqttInbox::default())),
        }
    }

    fn connection_status(&self) -> (bool, Option<i32>) {
        self.inbox
            .lock()
            .map(|inbox| (inbox.connected, inbox.last_error))
            .unwrap_or((false, None))
    }
}

impl BrokerTransport for EspMqttTransport {
    fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), TransportError> {
        self.client = None;
        if let Ok(mut inbox) = self.inbox.lock() {
            *inbox = MqttInbox::default();
        }

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: (!username.is_empty()).then_some(username),
            password: (!password.is_empty()).then_some(password),
            ..Default::default()
        };

        let inbox = self.inbox.clone();
        let client = EspMqttClient::new_cb(&self.url, &conf, move |event| {
            record_mqtt_event(&inbox, event.payload());
        })
        .map_err(|err| TransportError::new(err.code()))?;

        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        loop {
            feed_watchdog();
            match self.connection_status() {
                (true, _) => {
                    self.client = Some(client);
                    return Ok(());
                }
                (false, Some(code)) => return Err(TransportError::new(code)),
                (false, None) if Instant::now() >= deadline => {
                    return Err(TransportError::new(MQTT_CONNECTION_TIMEOUT));
                }
                (false, None) => thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connection_status().0
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let client = self
            .client
            .as_mut()
            .ok_or(TransportError::new(MQTT_CONNECTION_LOST))?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| TransportError::new(err.code()))
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        match self.inbox.lock() {
            Ok(mut inbox) => inbox.messages.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

struct PushRejected {
    status: u16,
    message: String,
}

/// Firmware push endpoint. The image is received and written on the HTTP
/// server's task; lifecycle events reach the main loop through the journal.
struct HttpOtaListener {
    password: String,
    journal: Arc<Mutex<UpdateJournal>>,
    server: Option<EspHttpServer<'static>>,
}

impl HttpOtaListener {
    fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            journal: Arc::new(Mutex::new(UpdateJournal::default())),
            server: None,
        }
    }
}

impl UpdateService for HttpOtaListener {
    type Error = anyhow::Error;

    fn begin(&mut self) -> anyhow::Result<()> {
        let conf = HttpConfiguration {
            http_port: OTA_PORT,
            stack_size: OTA_HTTP_STACK_SIZE,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        let journal = self.journal.clone();
        let password = self.password.clone();
        server.fn_handler::<anyhow::Error, _>(OTA_ROUTE, Method::Post, move |mut req| {
            match receive_image(&mut req, &journal, &password) {
                Ok(written) => write_text(req, 200, &format!("OK {written} bytes")),
                Err(rejected) => write_text(req, rejected.status, &rejected.message),
            }
        })?;

        info!("ota listening on port {OTA_PORT} at {OTA_ROUTE}");
        self.server = Some(server);
        Ok(())
    }

    fn handle(&mut self, handler: &mut dyn UpdateHandler) {
        let finished = match self.journal.lock() {
            Ok(mut journal) => journal.replay(handler),
            Err(_) => false,
        };
        if finished {
            info!("rebooting into new firmware");
            thread::sleep(Duration::from_millis(800));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    }
}

fn record(journal: &Mutex<UpdateJournal>, f: impl FnOnce(&mut UpdateJournal)) {
    if let Ok(mut journal) = journal.lock() {
        f(&mut journal);
    }
}

fn receive_image(
    req: &mut HttpRequest<'_, '_>,
    journal: &Mutex<UpdateJournal>,
    password: &str,
) -> Result<u64, PushRejected> {
    if !password.is_empty() && req.header(OTA_PASSWORD_HEADER) != Some(password) {
        record(journal, |journal| journal.fail(UpdateError::Auth));
        return Err(PushRejected {
            status: 403,
            message: "invalid OTA password".to_string(),
        });
    }

    let Some(total) = req.content_len().filter(|len| *len > 0) else {
        record(journal, |journal| journal.fail(UpdateError::Begin));
        return Err(PushRejected {
            status: 411,
            message: "image length required".to_string(),
        });
    };
    let expected_sha256 = req
        .header(OTA_SHA256_HEADER)
        .map(|value| value.trim().to_ascii_lowercase());

    let started = journal
        .lock()
        .map(|mut journal| journal.try_start())
        .unwrap_or(false);
    if !started {
        return Err(PushRejected {
            status: 409,
            message: "OTA update already in progress".to_string(),
        });
    }

    match write_image(req, journal, total, expected_sha256.as_deref()) {
        Ok(()) => {
            info!("ota image accepted ({total} bytes)");
            record(journal, UpdateJournal::finish);
            Ok(total)
        }
        Err((kind, err)) => {
            warn!("ota push failed: {err:#}");
            record(journal, |journal| journal.fail(kind));
            Err(PushRejected {
                status: 500,
                message: err.to_string(),
            })
        }
    }
}

fn write_image(
    req: &mut HttpRequest<'_, '_>,
    journal: &Mutex<UpdateJournal>,
    total: u64,
    expected_sha256: Option<&str>,
) -> Result<(), (UpdateError, anyhow::Error)> {
    let mut ota = EspOta::new()
        .map_err(|err| (UpdateError::Begin, anyhow!("failed to acquire OTA: {err:?}")))?;
    let mut update = ota.initiate_update().map_err(|err| {
        (
            UpdateError::Begin,
            anyhow!("failed to initiate OTA update: {err:?}"),
        )
    })?;

    let mut hasher = Sha256::new();
    let mut written = 0_u64;
    let mut chunk = vec![0_u8; OTA_CHUNK_SIZE];

    while written < total {
        let read = match req.read(&mut chunk) {
            Ok(0) => {
                let _ = update.abort();
                return Err((
                    UpdateError::Receive,
                    anyhow!("connection closed after {written} of {total} bytes"),
                ));
            }
            Ok(read) => read,
            Err(err) => {
                let _ = update.abort();
                let kind = if written == 0 {
                    UpdateError::Connect
                } else {
                    UpdateError::Receive
                };
                return Err((kind, anyhow!("failed reading OTA data: {err:?}")));
            }
        };

        if let Err(err) = update.write(&chunk[..read]) {
            let _ = update.abort();
            return Err((
                UpdateError::Receive,
                anyhow!("failed writing OTA data: {err:?}"),
            ));
        }
        hasher.update(&chunk[..read]);
        written = written.saturating_add(read as u64);
        record(journal, |journal| journal.progress(written, total));
    }

    let mut digest_hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }
    if let Some(expected) = expected_sha256 {
        if digest_hex != expected {
            let _ = update.abort();
            return Err((
                UpdateError::End,
                anyhow!("sha256 mismatch (expected {expected}, got {digest_hex})"),
            ));
        }
    }

    update.complete().map_err(|err| {
        (
            UpdateError::End,
            anyhow!("failed finalizing OTA image: {err:?}"),
        )
    })
}

fn write_text(req: HttpRequest<'_, '_>, status: u16, message: &str) -> anyhow::Result<()> {
    req.into_response(status, None, &[("Content-Type", "text/plain; charset=utf-8")])?
        .write_all(message.as_bytes())?;
    Ok(())
}

fn arm_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc != esp_idf_svc::sys::ESP_OK && rc != esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Err(anyhow!("esp_task_wdt_init failed with code {rc}"));
    }
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc != esp_idf_svc::sys::ESP_OK && rc != esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Err(anyhow!("esp_task_wdt_add failed with code {rc}"));
    }
    Ok(())
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
