//! Fakes for the hardware and transport seams.

use std::{
    cell::RefCell, collections::VecDeque, convert::Infallible, mem, net::Ipv4Addr, sync::Once,
    time::Duration,
};

use log::{LevelFilter, Log, Metadata, Record};

use crate::{
    broker::{BrokerTransport, TransportError},
    config::SecretsConfig,
    credentials::{CredentialStore, PlainSecrets},
    monitor::DoorInputs,
    network::{SystemControl, WifiLink},
    ota::{UpdateHandler, UpdateService},
    timing::Sleep,
    types::{DoorId, InboundMessage},
};

pub fn sealed_secrets() -> SecretsConfig {
    CredentialStore::seal_all(
        "test-key",
        &PlainSecrets {
            wifi_ssid: "HomeNetwork",
            wifi_pass: "hunter22",
            mqtt_user: "garage",
            mqtt_pass: "s3cret",
        },
    )
}

thread_local! {
    static CAPTURED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Collects formatted log lines per test thread.
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let line = record.args().to_string();
        CAPTURED.with(|captured| captured.borrow_mut().push(line));
    }

    fn flush(&self) {}
}

static CAPTURE_LOGGER: CaptureLogger = CaptureLogger;
static INSTALL_LOGGER: Once = Once::new();

/// Runs `f` and returns the log lines it emitted on this thread.
pub fn capture_logs(f: impl FnOnce()) -> Vec<String> {
    INSTALL_LOGGER.call_once(|| {
        if log::set_logger(&CAPTURE_LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
    CAPTURED.with(|captured| captured.borrow_mut().clear());
    f();
    CAPTURED.with(|captured| mem::take(&mut *captured.borrow_mut()))
}

#[derive(Debug, Default)]
pub struct RecordingSleep {
    pub sleeps: Vec<Duration>,
}

impl Sleep for RecordingSleep {
    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
    }
}

#[derive(Debug, Default)]
pub struct FakeSystem {
    pub restarts: u32,
}

impl SystemControl for FakeSystem {
    fn restart(&mut self) {
        self.restarts += 1;
    }
}

#[derive(Debug)]
pub struct FakeLink {
    pub connected: bool,
    pub succeed: bool,
    pub attempts: Vec<(String, String, Duration)>,
}

impl FakeLink {
    pub fn up() -> Self {
        Self {
            connected: true,
            succeed: true,
            attempts: Vec::new(),
        }
    }

    pub fn down() -> Self {
        Self {
            connected: false,
            succeed: false,
            attempts: Vec::new(),
        }
    }
}

impl WifiLink for FakeLink {
    fn connect_and_wait(&mut self, ssid: &str, password: &str, wait: Duration) -> bool {
        self.attempts
            .push((ssid.to_string(), password.to_string(), wait));
        self.connected = self.succeed;
        self.succeed
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.connected.then(|| Ipv4Addr::new(192, 168, 1, 42))
    }
}

#[derive(Debug, Default)]
pub struct FakeTransport {
    pub connected: bool,
    pub accept: bool,
    pub accept_after: Option<usize>,
    pub reject_code: i32,
    pub drop_on_poll: bool,
    pub connect_calls: Vec<(String, String, String)>,
    pub published: Vec<(String, String)>,
    pub inbound: Vec<InboundMessage>,
}

impl FakeTransport {
    pub fn accepting() -> Self {
        Self {
            accept: true,
            ..Self::default()
        }
    }

    pub fn rejecting(code: i32) -> Self {
        Self {
            reject_code: code,
            ..Self::default()
        }
    }
}

impl BrokerTransport for FakeTransport {
    fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), TransportError> {
        self.connect_calls.push((
            client_id.to_string(),
            username.to_string(),
            password.to_string(),
        ));
        let calls = self.connect_calls.len();
        if self.accept || self.accept_after.is_some_and(|after| calls >= after) {
            self.connected = true;
            Ok(())
        } else {
            Err(TransportError::new(self.reject_code))
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::new(-3));
        }
        self.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        if self.drop_on_poll {
            self.connected = false;
        }
        mem::take(&mut self.inbound)
    }
}

/// Replays one `[door 1, door 2]` sample per poll. Reading door 1 advances
/// to the next sample; the last sample repeats once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedDoors {
    samples: VecDeque<[bool; 2]>,
    current: [bool; 2],
}

impl ScriptedDoors {
    pub fn new(samples: impl IntoIterator<Item = [bool; 2]>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
            current: [false, false],
        }
    }
}

impl DoorInputs for ScriptedDoors {
    fn is_high(&mut self, door: DoorId) -> bool {
        match door {
            DoorId::One => {
                if let Some(next) = self.samples.pop_front() {
                    self.current = next;
                }
                self.current[0]
            }
            DoorId::Two => self.current[1],
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeUpdater {
    pub begun: bool,
    pub polls: u32,
    pub session: Option<(u64, u64)>,
}

impl UpdateService for FakeUpdater {
    type Error = Infallible;

    fn begin(&mut self) -> Result<(), Self::Error> {
        self.begun = true;
        Ok(())
    }

    fn handle(&mut self, handler: &mut dyn UpdateHandler) {
        self.polls += 1;
        if let Some((written, total)) = self.session.take() {
            handler.on_start();
            handler.on_progress(written, total);
            if written >= total {
                handler.on_end();
            }
        }
    }
}
