use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topics::BROKER_CLIENT_ID;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub broker_connect_attempts: u32,
    pub broker_retry_delay_ms: u64,
    pub network_connect_wait_ms: u64,
    pub network_restart_delay_ms: u64,
    pub link_restart_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            broker_connect_attempts: 20,
            broker_retry_delay_ms: 2_000,
            network_connect_wait_ms: 10_000,
            network_restart_delay_ms: 5_000,
            link_restart_grace_ms: 300_000,
        }
    }
}

impl TimingConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(50, 60_000);
        self.broker_connect_attempts = self.broker_connect_attempts.clamp(1, 100);
        self.broker_retry_delay_ms = self.broker_retry_delay_ms.min(60_000);
        self.network_connect_wait_ms = self.network_connect_wait_ms.clamp(1_000, 120_000);
        self.network_restart_delay_ms = self.network_restart_delay_ms.min(60_000);
        self.link_restart_grace_ms = self.link_restart_grace_ms.max(10_000);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn broker_retry_delay(&self) -> Duration {
        Duration::from_millis(self.broker_retry_delay_ms)
    }

    pub fn network_connect_wait(&self) -> Duration {
        Duration::from_millis(self.network_connect_wait_ms)
    }

    pub fn network_restart_delay(&self) -> Duration {
        Duration::from_millis(self.network_restart_delay_ms)
    }

    pub fn link_restart_grace(&self) -> Duration {
        Duration::from_millis(self.link_restart_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 1883,
            client_id: BROKER_CLIENT_ID.to_string(),
        }
    }
}

/// Encrypted secrets as lowercase hex, plus the key they were sealed with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub key: String,
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub timing: TimingConfig,
    pub broker: BrokerConfig,
    pub secrets: SecretsConfig,
    pub ota_password: String,
}

impl BridgeConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.timing.sanitize();
        self.broker.host = self.broker.host.trim().to_string();
        if self.broker.client_id.trim().is_empty() {
            self.broker.client_id = BROKER_CLIENT_ID.to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker host cannot be empty"));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker port must be between 1 and 65535"));
        }
        Ok(())
    }
}
