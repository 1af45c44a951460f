pub mod bridge;
pub mod broker;
pub mod config;
pub mod credentials;
pub mod monitor;
pub mod network;
pub mod notifier;
pub mod ota;
pub mod timing;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, BridgeParts};
pub use broker::{
    BrokerConnectionManager, BrokerState, BrokerTransport, PublishError, TransportError,
};
pub use config::{BridgeConfig, BrokerConfig, ConfigError, SecretsConfig, TimingConfig};
pub use credentials::{CredentialError, CredentialStore, PlainSecrets, SecretBuf, SecretId};
pub use monitor::{DoorInputs, DoorMonitor};
pub use network::{
    NetworkError, NetworkSession, NetworkSessionManager, RestartPolicy, SystemControl, WifiLink,
};
pub use ota::{
    ConsoleUpdateHandler, UpdateError, UpdateEvent, UpdateHandler, UpdateJournal, UpdateService,
};
pub use timing::{Sleep, ThreadSleep};
pub use topics::*;
pub use types::{DoorId, DoorState, InboundMessage, NotificationEvent};
