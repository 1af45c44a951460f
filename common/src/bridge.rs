use std::time::Instant;

use log::{info, warn};

use crate::{
    broker::{BrokerConnectionManager, BrokerTransport},
    config::{BridgeConfig, TimingConfig},
    credentials::CredentialStore,
    monitor::{DoorInputs, DoorMonitor},
    network::{
        NetworkError, NetworkSession, NetworkSessionManager, RestartPolicy, SystemControl,
        WifiLink,
    },
    notifier::notify,
    ota::{ConsoleUpdateHandler, UpdateService},
    timing::Sleep,
};

/// Platform pieces the bridge is assembled from.
pub struct BridgeParts<L, C, T, U, I, S> {
    pub link: L,
    pub system: C,
    pub transport: T,
    pub updater: U,
    pub doors: I,
    pub sleeper: S,
}

/// The door-to-broker control loop. Everything runs on the calling thread.
pub struct Bridge<L, C, T, U, I, S> {
    credentials: CredentialStore,
    timing: TimingConfig,
    network: NetworkSessionManager<L, C>,
    broker: BrokerConnectionManager<T>,
    updater: U,
    update_handler: ConsoleUpdateHandler,
    doors: I,
    monitor: DoorMonitor,
    sleeper: S,
}

impl<L, C, T, U, I, S> Bridge<L, C, T, U, I, S>
where
    L: WifiLink,
    C: SystemControl,
    T: BrokerTransport,
    U: UpdateService,
    I: DoorInputs,
    S: Sleep,
{
    pub fn new(config: &BridgeConfig, parts: BridgeParts<L, C, T, U, I, S>) -> Self {
        let mut timing = config.timing.clone();
        timing.sanitize();
        Self {
            credentials: CredentialStore::new(&config.secrets),
            network: NetworkSessionManager::new(
                parts.link,
                parts.system,
                RestartPolicy::from(&timing),
            ),
            broker: BrokerConnectionManager::new(parts.transport, config.broker.clone(), &timing),
            updater: parts.updater,
            update_handler: ConsoleUpdateHandler::default(),
            doors: parts.doors,
            monitor: DoorMonitor::new(),
            sleeper: parts.sleeper,
            timing,
        }
    }

    pub fn broker(&self) -> &BrokerConnectionManager<T> {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut BrokerConnectionManager<T> {
        &mut self.broker
    }

    pub fn network(&self) -> &NetworkSessionManager<L, C> {
        &self.network
    }

    pub fn monitor(&self) -> &DoorMonitor {
        &self.monitor
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }

    pub fn update_handler(&self) -> &ConsoleUpdateHandler {
        &self.update_handler
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Brings up the network, arms the update listener and announces the
    /// initial state of both doors.
    pub fn start(&mut self) -> Result<NetworkSession, NetworkError> {
        let session = self.network.connect(&self.credentials, &mut self.sleeper)?;

        match self.updater.begin() {
            Ok(()) => info!("remote update listener armed"),
            Err(err) => warn!("remote update listener failed to start: {err}"),
        }
        info!(
            "Ready; broker target {}:{}",
            self.broker.broker().host,
            self.broker.broker().port
        );

        self.broker.ensure_connected(&self.credentials, &mut self.sleeper);
        for event in self.monitor.startup_events() {
            notify(&mut self.broker, event);
        }
        Ok(session)
    }

    /// One loop iteration without the trailing sleep. Returns the payloads
    /// emitted for detected transitions.
    pub fn tick(&mut self, now: Instant) -> Vec<String> {
        if self.network.check_link(now, &mut self.sleeper) {
            return Vec::new();
        }

        self.broker.ensure_connected(&self.credentials, &mut self.sleeper);
        self.broker.service();
        self.updater.handle(&mut self.update_handler);

        self.monitor
            .poll(&mut self.doors)
            .into_iter()
            .map(|event| notify(&mut self.broker, event))
            .collect()
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.tick(Instant::now());
            self.sleeper.sleep(self.timing.poll_interval());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        broker::BrokerState,
        ota::UpdatePhase,
        testing::{
            sealed_secrets, FakeLink, FakeSystem, FakeTransport, FakeUpdater, RecordingSleep,
            ScriptedDoors,
        },
        types::{DoorId, DoorState},
    };

    type TestBridge =
        Bridge<FakeLink, FakeSystem, FakeTransport, FakeUpdater, ScriptedDoors, RecordingSleep>;

    fn bridge(link: FakeLink, transport: FakeTransport, doors: ScriptedDoors) -> TestBridge {
        let config = BridgeConfig {
            secrets: sealed_secrets(),
            ..BridgeConfig::default()
        };
        Bridge::new(
            &config,
            BridgeParts {
                link,
                system: FakeSystem::default(),
                transport,
                updater: FakeUpdater::default(),
                doors,
                sleeper: RecordingSleep::default(),
            },
        )
    }

    fn published(bridge: &TestBridge) -> Vec<String> {
        bridge
            .broker()
            .transport()
            .published
            .iter()
            .map(|(topic, payload)| {
                assert_eq!(topic, "garageDoors");
                payload.clone()
            })
            .collect()
    }

    #[test]
    fn example_scenario() {
        let doors = ScriptedDoors::new([[true, false], [true, true]]);
        let mut bridge = bridge(FakeLink::up(), FakeTransport::accepting(), doors);

        bridge.start().unwrap();
        assert_eq!(published(&bridge), vec!["1:closed", "2:closed"]);

        assert_eq!(bridge.tick(Instant::now()), vec!["1:open"]);
        assert_eq!(bridge.tick(Instant::now()), vec!["2:open"]);
        assert_eq!(
            published(&bridge),
            vec!["1:closed", "2:closed", "1:open", "2:open"]
        );
    }

    #[test]
    fn startup_announces_even_when_doors_already_closed() {
        let doors = ScriptedDoors::new([[false, false]]);
        let mut bridge = bridge(FakeLink::up(), FakeTransport::accepting(), doors);

        bridge.start().unwrap();
        assert!(bridge.tick(Instant::now()).is_empty());

        assert_eq!(published(&bridge), vec!["1:closed", "2:closed"]);
        assert_eq!(bridge.monitor().state(DoorId::One), DoorState::Closed);
    }

    #[test]
    fn start_arms_updater_and_tick_polls_it() {
        let mut bridge = bridge(
            FakeLink::up(),
            FakeTransport::accepting(),
            ScriptedDoors::default(),
        );

        bridge.start().unwrap();
        assert!(bridge.updater().begun);

        bridge.tick(Instant::now());
        bridge.tick(Instant::now());
        assert_eq!(bridge.updater().polls, 2);
    }

    #[test]
    fn update_session_reaches_handler() {
        let mut bridge = bridge(
            FakeLink::up(),
            FakeTransport::accepting(),
            ScriptedDoors::default(),
        );
        bridge.start().unwrap();

        bridge.updater.session = Some((100, 400));
        bridge.tick(Instant::now());

        assert_eq!(
            bridge.update_handler().phase(),
            UpdatePhase::InProgress { percent: 25 }
        );
    }

    #[test]
    fn network_failure_restarts_before_anything_else() {
        let mut bridge = bridge(
            FakeLink::down(),
            FakeTransport::accepting(),
            ScriptedDoors::default(),
        );

        assert!(bridge.start().is_err());
        assert_eq!(bridge.network().system().restarts, 1);
        assert!(!bridge.updater().begun);
        assert!(bridge.broker().transport().connect_calls.is_empty());
    }

    #[test]
    fn broker_outage_still_tracks_doors() {
        let doors = ScriptedDoors::new([[true, false]]);
        let mut bridge = bridge(FakeLink::up(), FakeTransport::rejecting(-2), doors);

        bridge.start().unwrap();
        assert_eq!(bridge.broker().state(), BrokerState::Disconnected);
        assert_eq!(bridge.broker().transport().connect_calls.len(), 20);

        assert_eq!(bridge.tick(Instant::now()), vec!["1:open"]);
        assert_eq!(bridge.broker().transport().connect_calls.len(), 40);
        assert!(published(&bridge).is_empty());
        assert_eq!(bridge.monitor().state(DoorId::One), DoorState::Open);
    }

    #[test]
    fn reconnects_after_session_drop() {
        let mut bridge = bridge(
            FakeLink::up(),
            FakeTransport::accepting(),
            ScriptedDoors::new([[false, false], [false, false], [false, true]]),
        );
        bridge.start().unwrap();

        bridge.broker_mut().transport_mut().drop_on_poll = true;
        bridge.tick(Instant::now());
        assert_eq!(bridge.broker().state(), BrokerState::Disconnected);

        bridge.broker_mut().transport_mut().drop_on_poll = false;
        bridge.tick(Instant::now());
        assert_eq!(bridge.broker().state(), BrokerState::Connected);

        assert_eq!(bridge.tick(Instant::now()), vec!["2:open"]);
        assert_eq!(bridge.broker().transport().connect_calls.len(), 2);
        assert_eq!(published(&bridge).last().map(String::as_str), Some("2:open"));
    }

    #[test]
    fn prolonged_link_loss_skips_iteration_and_restarts() {
        let mut bridge = bridge(
            FakeLink::up(),
            FakeTransport::accepting(),
            ScriptedDoors::new([[true, true]]),
        );
        bridge.start().unwrap();

        let start = Instant::now();
        bridge.network.link_mut().connected = false;
        bridge.tick(start);
        let emitted = bridge.tick(start + Duration::from_secs(301));

        assert!(emitted.is_empty());
        assert_eq!(bridge.network().system().restarts, 1);
        assert!(bridge.sleeper().sleeps.contains(&Duration::from_secs(5)));
    }
}
