use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;

use crate::{
    config::{BrokerConfig, TimingConfig},
    credentials::{CredentialStore, SecretId},
    timing::Sleep,
    topics::TOPIC_GARAGE_DOORS,
    types::InboundMessage,
};

/// Failure reported by the transport, carrying its native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transport error code {code}")]
pub struct TransportError {
    pub code: i32,
}

impl TransportError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("broker session is not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Persistent publish/subscribe session to the broker.
pub trait BrokerTransport {
    fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
    /// Services keepalive and returns messages received since the last call.
    fn poll(&mut self) -> Vec<InboundMessage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct BrokerConnectionManager<T> {
    transport: T,
    broker: BrokerConfig,
    attempts: u32,
    retry_delay: Duration,
    state: BrokerState,
}

impl<T: BrokerTransport> BrokerConnectionManager<T> {
    pub fn new(transport: T, broker: BrokerConfig, timing: &TimingConfig) -> Self {
        Self {
            transport,
            broker,
            attempts: timing.broker_connect_attempts.max(1),
            retry_delay: timing.broker_retry_delay(),
            state: BrokerState::Disconnected,
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub fn broker(&self) -> &BrokerConfig {
        &self.broker
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Opens a session if there is none. Gives up after the configured
    /// number of attempts and leaves the next call to start over.
    pub fn ensure_connected<S: Sleep>(
        &mut self,
        credentials: &CredentialStore,
        sleeper: &mut S,
    ) -> BrokerState {
        if self.transport.is_connected() {
            self.state = BrokerState::Connected;
            return self.state;
        }
        if self.state == BrokerState::Connected {
            warn!("mqtt session lost");
        }
        self.state = BrokerState::Connecting;

        // Decrypted per call so plaintext never outlives this attempt.
        let decrypted = credentials
            .decrypt(SecretId::BrokerUsername)
            .and_then(|user| Ok((user, credentials.decrypt(SecretId::BrokerPassword)?)));
        let (username, password) = match decrypted {
            Ok(pair) => pair,
            Err(err) => {
                error!("mqtt credentials unusable: {err}");
                self.state = BrokerState::Disconnected;
                return self.state;
            }
        };

        for attempt in 1..=self.attempts {
            info!("Connecting to MQTT...");
            match self.transport.connect(
                &self.broker.client_id,
                username.as_str(),
                password.as_str(),
            ) {
                Ok(()) => {
                    info!("connected");
                    self.state = BrokerState::Connected;
                    return self.state;
                }
                Err(err) => {
                    warn!("failed with state {}", err.code);
                    if attempt < self.attempts {
                        sleeper.sleep(self.retry_delay);
                    }
                }
            }
        }

        error!(
            "Failed to connect to MQTT server on {}:{}",
            self.broker.host, self.broker.port
        );
        self.state = BrokerState::Disconnected;
        self.state
    }

    /// Drains inbound traffic and notices a dropped session.
    pub fn service(&mut self) {
        if self.state != BrokerState::Connected {
            return;
        }
        for message in self.transport.poll() {
            info!(
                "Message arrived [{}] {}",
                message.topic,
                String::from_utf8_lossy(&message.payload)
            );
        }
        if !self.transport.is_connected() {
            warn!("mqtt transport reported disconnect");
            self.state = BrokerState::Disconnected;
        }
    }

    /// Fire-and-forget publish to the door topic.
    pub fn publish(&mut self, payload: &[u8]) -> Result<(), PublishError> {
        if self.state != BrokerState::Connected || !self.transport.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.transport
            .publish(TOPIC_GARAGE_DOORS, payload)
            .map_err(PublishError::from)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{capture_logs, sealed_secrets, FakeTransport, RecordingSleep};

    fn manager(transport: FakeTransport) -> BrokerConnectionManager<FakeTransport> {
        let broker = BrokerConfig {
            host: "10.0.0.2".to_string(),
            port: 1884,
            ..BrokerConfig::default()
        };
        BrokerConnectionManager::new(transport, broker, &TimingConfig::default())
    }

    #[test]
    fn rejecting_broker_gets_exactly_twenty_attempts() {
        let store = CredentialStore::new(&sealed_secrets());
        let mut broker = manager(FakeTransport::rejecting(5));
        let mut sleeper = RecordingSleep::default();

        let state = broker.ensure_connected(&store, &mut sleeper);

        assert_eq!(state, BrokerState::Disconnected);
        assert_eq!(broker.transport().connect_calls.len(), 20);
        assert_eq!(sleeper.sleeps.len(), 19);
        assert!(sleeper.sleeps.iter().all(|d| *d == Duration::from_secs(2)));
    }

    #[test]
    fn failures_log_native_code_and_broker_address() {
        let store = CredentialStore::new(&sealed_secrets());
        let mut broker = manager(FakeTransport::rejecting(-2));
        let mut sleeper = RecordingSleep::default();

        let lines = capture_logs(|| {
            broker.ensure_connected(&store, &mut sleeper);
        });

        let attempts: Vec<_> = lines
            .iter()
            .filter(|line| line.as_str() == "failed with state -2")
            .collect();
        assert_eq!(attempts.len(), 20);
        assert_eq!(
            lines.last().map(String::as_str),
            Some("Failed to connect to MQTT server on 10.0.0.2:1884")
        );
    }

    #[test]
    fn publishes_to_door_topic() {
        let store = CredentialStore::new(&sealed_secrets());
        let mut broker = manager(FakeTransport::accepting());
        let mut sleeper = RecordingSleep::default();
        broker.ensure_connected(&store, &mut sleeper);

        broker.publish(b"2:closed").unwrap();

        assert_eq!(
            broker.transport().published,
            vec![("garageDoors".to_string(), "2:closed".to_string())]
        );
    }

    #[test]
    fn uses_client_id_and_decrypted_credentials() {
        let store = CredentialStore::new(&sealed_secrets());
        let mut broker = manager(FakeTransport::accepting());
        let mut sleeper = RecordingSleep::default();

        assert_eq!(broker.ensure_connected(&store, &mut sleeper), BrokerState::Connected);
        assert_eq!(
            broker.transport().connect_calls,
            vec![(
                "GarageDoors".to_string(),
                "garage".to_string(),
                "s3cret".to_string()
            )]
        );
    }

    #[test]
    fn connects_on_a_later_attempt() {
        let store = CredentialStore::new(&sealed_secrets());
        let mut transport = FakeTransport::rejecting(5);
        transport.accept_after = Some(3);
        let mut broker = manager(transport);
        let mut sleeper = RecordingSleep::default();

        assert_eq!(broker.ensure_connected(&store, &mut sleeper), BrokerState::Connected);
        assert_eq!(broker.transport().connect_calls.len(), 3);
        assert_eq!(sleeper.sleeps.len(), 2);
    }

    #[test]
    fn connected_session_is_left_alone() {
        let store = CredentialStore::new(&sealed_secrets());
        let mut broker = manager(FakeTransport::accepting());
        let mut sleeper = RecordingSleep::default();

        broker.ensure_connected(&store, &mut sleeper);
        broker.ensure_connected(&store, &mut sleeper);

        assert_eq!(broker.transport().connect_calls.len(), 1);
    }

    #[test]
    fn service_detects_drop_and_next_call_reconnects() {
        let store = CredentialStore::new(&sealed_secrets());
        let mut broker = manager(FakeTransport::accepting());
        let mut sleeper = RecordingSleep::default();
        broker.ensure_connected(&store, &mut sleeper);

        broker.transport_mut().drop_on_poll = true;
        broker.service();
        assert_eq!(broker.state(), BrokerState::Disconnected);

        broker.transport_mut().drop_on_poll = false;
        assert_eq!(broker.ensure_connected(&store, &mut sleeper), BrokerState::Connected);
        assert_eq!(broker.transport().connect_calls.len(), 2);
    }

    #[test]
    fn service_drains_inbound_messages() {
        let store = CredentialStore::new(&sealed_secrets());
        let mut broker = manager(FakeTransport::accepting());
        let mut sleeper = RecordingSleep::default();
        broker.ensure_connected(&store, &mut sleeper);

        broker.transport_mut().inbound.push(InboundMessage {
            topic: "garageDoors/cmd".to_string(),
            payload: b"ping".to_vec(),
        });
        broker.service();

        assert!(broker.transport().inbound.is_empty());
        assert_eq!(broker.state(), BrokerState::Connected);
    }

    #[test]
    fn publish_requires_session() {
        let mut broker = manager(FakeTransport::accepting());
        assert_eq!(broker.publish(b"1:open"), Err(PublishError::NotConnected));
        assert!(broker.transport().published.is_empty());
    }

    #[test]
    fn bad_broker_credentials_skip_attempts() {
        let mut secrets = sealed_secrets();
        secrets.mqtt_pass = "00".repeat(12);
        let store = CredentialStore::new(&secrets);
        let mut broker = manager(FakeTransport::accepting());
        let mut sleeper = RecordingSleep::default();

        assert_eq!(broker.ensure_connected(&store, &mut sleeper), BrokerState::Disconnected);
        assert!(broker.transport().connect_calls.is_empty());
    }
}
