use std::{
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use log::{error, info, warn};
use thiserror::Error;

use crate::{
    config::TimingConfig,
    credentials::{CredentialError, CredentialStore, SecretBuf, SecretId},
    timing::Sleep,
};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("wifi association failed; device restart requested")]
    RestartRequested,
}

/// Station-mode network link.
pub trait WifiLink {
    /// Starts association and blocks up to `wait` for an address. Returns
    /// whether the link came up.
    fn connect_and_wait(&mut self, ssid: &str, password: &str, wait: Duration) -> bool;
    fn is_connected(&self) -> bool;
    fn local_ip(&self) -> Option<Ipv4Addr>;
}

/// Whole-device control. On hardware `restart` does not return.
pub trait SystemControl {
    fn restart(&mut self);
}

/// When and how the device gives up on the network and reboots.
///
/// Association failure is never retried in place. The device reboots after
/// `restart_delay` and starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub connect_wait: Duration,
    pub restart_delay: Duration,
    pub link_grace: Duration,
}

impl From<&TimingConfig> for RestartPolicy {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            connect_wait: timing.network_connect_wait(),
            restart_delay: timing.network_restart_delay(),
            link_grace: timing.link_restart_grace(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSession {
    pub address: Option<Ipv4Addr>,
}

/// Tracks how long the link has been down during normal operation.
#[derive(Debug, Clone)]
pub struct LinkWatch {
    grace: Duration,
    down_since: Option<Instant>,
}

impl LinkWatch {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            down_since: None,
        }
    }

    /// Returns true once the link has been down for longer than the grace
    /// period.
    pub fn observe(&mut self, connected: bool, now: Instant) -> bool {
        if connected {
            self.down_since = None;
            return false;
        }
        match self.down_since {
            Some(since) => now.saturating_duration_since(since) >= self.grace,
            None => {
                self.down_since = Some(now);
                false
            }
        }
    }
}

pub struct NetworkSessionManager<L, C> {
    link: L,
    system: C,
    policy: RestartPolicy,
    watch: LinkWatch,
}

impl<L: WifiLink, C: SystemControl> NetworkSessionManager<L, C> {
    pub fn new(link: L, system: C, policy: RestartPolicy) -> Self {
        Self {
            link,
            system,
            policy,
            watch: LinkWatch::new(policy.link_grace),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn system(&self) -> &C {
        &self.system
    }

    /// Brings the link up with freshly decrypted credentials, or restarts the
    /// device when the link does not come up in time.
    pub fn connect<S: Sleep>(
        &mut self,
        credentials: &CredentialStore,
        sleeper: &mut S,
    ) -> Result<NetworkSession, NetworkError> {
        let connected = match Self::decrypt_credentials(credentials) {
            Ok((ssid, password)) => {
                info!("wifi connecting to `{}`", ssid.as_str());
                self.link
                    .connect_and_wait(ssid.as_str(), password.as_str(), self.policy.connect_wait)
            }
            Err(err) => {
                error!("wifi credentials unusable: {err}");
                false
            }
        };

        if !connected {
            self.restart(sleeper, "Connection Failed! Rebooting...");
            return Err(NetworkError::RestartRequested);
        }

        let session = NetworkSession {
            address: self.link.local_ip(),
        };
        match session.address {
            Some(address) => info!("IP address: {address}"),
            None => warn!("IP address: unknown"),
        }
        Ok(session)
    }

    /// Restarts the device when the link has stayed down past the grace
    /// period. Returns true if a restart was requested.
    pub fn check_link<S: Sleep>(&mut self, now: Instant, sleeper: &mut S) -> bool {
        if !self.watch.observe(self.link.is_connected(), now) {
            return false;
        }
        let message = format!(
            "wifi disconnected for {}s; restarting device for recovery",
            self.policy.link_grace.as_secs()
        );
        self.restart(sleeper, &message);
        true
    }

    fn restart<S: Sleep>(&mut self, sleeper: &mut S, message: &str) {
        error!("{message}");
        sleeper.sleep(self.policy.restart_delay);
        self.system.restart();
    }

    fn decrypt_credentials(
        credentials: &CredentialStore,
    ) -> Result<(SecretBuf, SecretBuf), CredentialError> {
        let ssid = credentials.decrypt(SecretId::WifiSsid)?;
        let password = credentials.decrypt(SecretId::WifiPassword)?;
        Ok((ssid, password))
    }
}
