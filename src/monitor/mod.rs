//! Endpoint health monitoring.
//!
//! Every (monitor, service, endpoint) triple registered by the [service manager][crate::service]
//! gets a [`MonitorManager`] entry running its own probe loop. The loop feeds a [`HealthState`]
//! and publishes transitions through the endpoint's shared [`Health`] flag, which the routing
//! strategies read on the query path without locking.
//!
//! Entries outlive configuration reloads: re-registering a triple cancels the running loop and
//! starts a new one seeded with the last known status, and [`MonitorManager::snapshot_statuses`]
//! keeps statuses across a full reconciliation pass.

use crate::backend::{DynBackend, Kind, LoadFailure, Listing};
use crate::error::Error;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod config;
mod probe;

#[allow(clippy::module_name_repetitions)]
pub use config::{MonitorConfig, Probe};

/// A shared, lock-free up/down flag for one endpoint.
#[derive(Debug, Clone)]
pub struct Health(Arc<AtomicBool>);

impl Health {
    #[must_use]
    pub fn new(up: bool) -> Self {
        Health(Arc::new(AtomicBool::new(up)))
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, up: bool) {
        self.0.store(up, Ordering::Relaxed);
    }
}

/// Unmonitored endpoints are always up.
impl Default for Health {
    fn default() -> Self {
        Health::new(true)
    }
}

/// The up/down state machine of one monitor entry.
///
/// Results agreeing with the current status reset the opposite counter. Results disagreeing with
/// it count towards a transition, which happens once the monitor's threshold is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    pub up: bool,
    successes: u32,
    failures: u32,
}

impl HealthState {
    #[must_use]
    pub fn new(up: bool) -> Self {
        HealthState {
            up,
            successes: 0,
            failures: 0,
        }
    }

    /// Record one probe result, returning the new status if it changed.
    pub fn observe(&mut self, success: bool, config: &MonitorConfig) -> Option<bool> {
        if success {
            self.failures = 0;
            if !self.up {
                self.successes += 1;
                if self.successes >= config.up_threshold {
                    self.up = true;
                    self.successes = 0;
                    return Some(true);
                }
            }
        } else {
            self.successes = 0;
            if self.up {
                self.failures += 1;
                if self.failures >= config.down_threshold {
                    self.up = false;
                    self.failures = 0;
                    return Some(false);
                }
            }
        }
        None
    }
}

/// Identity of a monitor entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryKey {
    pub monitor: String,
    pub service: String,
    pub endpoint: String,
}

/// A monitored endpoint of a service, as handed to [`MonitorManager::register_endpoints`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub key: EntryKey,
    pub address: IpAddr,
    pub health: Health,
}

struct Entry {
    address: IpAddr,
    health: Health,
    config: Arc<MonitorConfig>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Entry {
    fn start(key: EntryKey, address: IpAddr, health: Health, config: Arc<MonitorConfig>) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(probe_loop(
            key,
            address,
            health.clone(),
            config.clone(),
            cancel.clone(),
        ));
        Entry {
            address,
            health,
            config,
            cancel,
            task,
        }
    }

    /// Cancel the probe loop and wait for it to finish, so it can't publish a stale result.
    async fn stop(self) -> Health {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "monitor probe task ended abnormally");
        }
        self.health
    }
}

async fn probe_loop(
    key: EntryKey,
    address: IpAddr,
    health: Health,
    config: Arc<MonitorConfig>,
    cancel: CancellationToken,
) {
    let mut state = HealthState::new(health.is_up());
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately and the status is already seeded.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let success = tokio::select! {
            () = cancel.cancelled() => break,
            success = config.probe.check(address, config.timeout) => success,
        };
        debug!(
            monitor = key.monitor,
            service = key.service,
            endpoint = key.endpoint,
            success,
            "probe finished"
        );
        if let Some(up) = state.observe(success, &config) {
            info!(
                monitor = key.monitor,
                service = key.service,
                endpoint = key.endpoint,
                %address,
                up,
                "endpoint health changed"
            );
            health.set(up);
        }
    }
}

/// Status of one monitor entry, as reported by the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryStatus {
    #[serde(flatten)]
    pub key: EntryKey,
    pub address: IpAddr,
    pub up: bool,
}

/// Owns the loaded monitors and the running monitor entries.
#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct MonitorManager {
    monitors: HashMap<String, Arc<MonitorConfig>>,
    present: HashSet<String>,
    listing_complete: bool,
    entries: HashMap<EntryKey, Entry>,
    snapshot: HashMap<EntryKey, bool>,
}

impl MonitorManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<MonitorConfig>> {
        self.monitors.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.monitors.contains_key(name)
    }

    /// Add a monitor directly, replacing any monitor of the same name. Running entries of a
    /// replaced monitor are restarted against the new definition, keeping their status.
    pub async fn insert(&mut self, config: MonitorConfig) {
        let name = config.name.clone();
        self.monitors.insert(name.clone(), Arc::new(config));
        self.restart_entries(&name).await;
    }

    /// Start monitoring `address` for the given triple.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MonitorUndefined`] if the monitor isn't loaded.
    pub async fn register_endpoint(
        &mut self,
        key: EntryKey,
        address: IpAddr,
        health: Health,
    ) -> Result<(), Error> {
        self.register_endpoints(vec![Registration {
            key,
            address,
            health,
        }])
        .await
    }

    /// Start monitoring every registration.
    ///
    /// The initial status of an entry comes from, in order: the entry already running for the
    /// triple (which is stopped first), the last [snapshot](Self::snapshot_statuses), or one
    /// probe run right away. Those probes run concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MonitorUndefined`] if a monitor isn't loaded. Nothing is registered then.
    pub async fn register_endpoints(
        &mut self,
        registrations: Vec<Registration>,
    ) -> Result<(), Error> {
        let configs = registrations
            .iter()
            .map(|registration| {
                self.monitors
                    .get(&registration.key.monitor)
                    .cloned()
                    .ok_or_else(|| Error::MonitorUndefined(registration.key.monitor.clone()))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut seeds = Vec::with_capacity(registrations.len());
        for registration in &registrations {
            let seed = match self.entries.remove(&registration.key) {
                Some(prior) => Some(prior.stop().await.is_up()),
                None => self.snapshot.get(&registration.key).copied(),
            };
            seeds.push(seed);
        }
        let initial = join_all(registrations.iter().zip(&configs).zip(&seeds).map(
            |((registration, config), seed)| async move {
                match seed {
                    Some(up) => *up,
                    None => {
                        config
                            .probe
                            .check(registration.address, config.timeout)
                            .await
                    }
                }
            },
        ))
        .await;

        for ((registration, config), up) in registrations.into_iter().zip(configs).zip(initial) {
            let Registration {
                key,
                address,
                health,
            } = registration;
            health.set(up);
            debug!(
                monitor = key.monitor,
                service = key.service,
                endpoint = key.endpoint,
                up,
                "registered endpoint"
            );
            let entry = Entry::start(key.clone(), address, health, config);
            self.entries.insert(key, entry);
        }
        Ok(())
    }

    /// Stop monitoring the triple. Returns whether an entry existed.
    pub async fn unregister_endpoint(&mut self, key: &EntryKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                entry.stop().await;
                debug!(
                    monitor = key.monitor,
                    service = key.service,
                    endpoint = key.endpoint,
                    "unregistered endpoint"
                );
                true
            }
            None => false,
        }
    }

    /// Remember the status of every entry, so entries recreated during this pass keep it.
    pub fn snapshot_statuses(&mut self) {
        self.snapshot = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.health.is_up()))
            .collect();
    }

    #[must_use]
    pub fn status(&self, key: &EntryKey) -> Option<bool> {
        self.entries.get(key).map(|entry| entry.health.is_up())
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<EntryStatus> {
        let mut statuses: Vec<EntryStatus> = self
            .entries
            .iter()
            .map(|(key, entry)| EntryStatus {
                key: key.clone(),
                address: entry.address,
                up: entry.health.is_up(),
            })
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    async fn restart_entries(&mut self, monitor: &str) {
        let Some(config) = self.monitors.get(monitor).cloned() else {
            return;
        };
        let keys: Vec<EntryKey> = self
            .entries
            .keys()
            .filter(|key| key.monitor == monitor)
            .cloned()
            .collect();
        for key in keys {
            if let Some(prior) = self.entries.remove(&key) {
                let address = prior.address;
                let health = prior.stop().await;
                let entry = Entry::start(key.clone(), address, health, config.clone());
                self.entries.insert(key, entry);
            }
        }
    }

    /// Load new and changed monitors from `backends`. Monitors are matched by name; the first
    /// backend listing a name wins.
    pub async fn reconcile(&mut self, backends: &[DynBackend]) -> Vec<LoadFailure> {
        let mut failures = Vec::new();
        self.present.clear();
        self.listing_complete = true;

        for backend in backends {
            let listings = match backend.list_monitors().await {
                Ok(listings) => listings,
                Err(error) => {
                    self.listing_complete = false;
                    failures.push(LoadFailure::new(Kind::Monitor, backend.describe(), error));
                    continue;
                }
            };
            for Listing {
                name,
                last_modified,
            } in listings
            {
                if !self.present.insert(name.clone()) {
                    continue;
                }
                if self
                    .monitors
                    .get(&name)
                    .is_some_and(|current| current.last_modified == last_modified)
                {
                    continue;
                }
                let loaded = match backend.get_monitor(&name).await {
                    Ok(content) => MonitorConfig::from_yaml(&name, &content, last_modified),
                    Err(error) => Err(error),
                };
                match loaded {
                    Ok(config) => {
                        info!(monitor = name, "loaded monitor");
                        self.insert(config).await;
                    }
                    Err(error) => failures.push(LoadFailure::new(Kind::Monitor, name, error)),
                }
            }
        }
        failures
    }

    /// Remove monitors missing from the last reconciliation pass. A monitor with running entries
    /// is kept until the services using it are updated or removed.
    pub fn prune(&mut self) {
        if !self.listing_complete {
            return;
        }
        let missing: Vec<String> = self
            .monitors
            .keys()
            .filter(|name| !self.present.contains(*name))
            .cloned()
            .collect();
        for name in missing {
            if self.entries.keys().any(|key| key.monitor == name) {
                warn!(monitor = name, "monitor still in use, deferring removal");
                continue;
            }
            self.monitors.remove(&name);
            info!(monitor = name, "removed monitor");
        }
    }

    /// Stop every probe loop.
    pub async fn shutdown(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use std::net::Ipv4Addr;
    use std::time::{Duration, SystemTime};
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn make_config(port: u16, up_threshold: u32, down_threshold: u32) -> MonitorConfig {
        MonitorConfig {
            name: "web".to_string(),
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(20),
            up_threshold,
            down_threshold,
            probe: Probe::Tcp { port },
            last_modified: SystemTime::UNIX_EPOCH,
        }
    }

    fn make_key(endpoint: &str) -> EntryKey {
        EntryKey {
            monitor: "web".to_string(),
            service: "service1".to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    /// A port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn state_machine_thresholds() {
        let config = make_config(1, 2, 3);
        let mut state = HealthState::new(true);

        assert_eq!(state.observe(false, &config), None);
        assert_eq!(state.observe(false, &config), None);
        // A success resets the failure count.
        assert_eq!(state.observe(true, &config), None);
        assert_eq!(state.observe(false, &config), None);
        assert_eq!(state.observe(false, &config), None);
        assert_eq!(state.observe(false, &config), Some(false));
        assert!(!state.up);

        assert_eq!(state.observe(true, &config), None);
        assert_eq!(state.observe(false, &config), None);
        assert_eq!(state.observe(true, &config), None);
        assert_eq!(state.observe(true, &config), Some(true));
        assert!(state.up);
    }

    #[tokio::test]
    async fn initial_status_comes_from_a_probe() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let up_port = listener.local_addr().unwrap().port();
        let down_port = closed_port().await;

        let mut manager = MonitorManager::new();
        manager.insert(make_config(up_port, 1, 1)).await;
        let health = Health::new(false);
        manager
            .register_endpoint(make_key("a"), LOCALHOST, health.clone())
            .await
            .unwrap();
        assert!(health.is_up());

        let mut manager = MonitorManager::new();
        manager.insert(make_config(down_port, 1, 1)).await;
        let health = Health::new(true);
        manager
            .register_endpoint(make_key("a"), LOCALHOST, health.clone())
            .await
            .unwrap();
        assert!(!health.is_up());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reregistration_keeps_status() {
        let port = closed_port().await;
        let mut manager = MonitorManager::new();
        // Thresholds high enough that the loop never flips the status during the test.
        manager.insert(make_config(port, 1000, 1000)).await;

        let key = make_key("a");
        let health = Health::new(true);
        manager
            .register_endpoint(key.clone(), LOCALHOST, health.clone())
            .await
            .unwrap();
        assert!(!health.is_up());

        // Pretend the endpoint came back up, then re-register the same triple.
        health.set(true);
        let fresh = Health::new(false);
        manager
            .register_endpoint(key.clone(), LOCALHOST, fresh.clone())
            .await
            .unwrap();
        assert!(fresh.is_up());
        assert_eq!(manager.status(&key), Some(true));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn changed_monitor_restarts_entries() {
        let port = closed_port().await;
        let mut manager = MonitorManager::new();
        manager.insert(make_config(port, 1000, 1000)).await;

        let key = make_key("a");
        let health = Health::new(true);
        manager
            .register_endpoint(key.clone(), LOCALHOST, health.clone())
            .await
            .unwrap();
        assert_eq!(manager.status(&key), Some(false));
        health.set(true);
        let old_cancel = manager.entries[&key].cancel.clone();

        let other_port = closed_port().await;
        let changed = MonitorConfig {
            interval: Duration::from_millis(40),
            ..make_config(other_port, 1000, 1000)
        };
        manager.insert(changed.clone()).await;

        assert!(old_cancel.is_cancelled());
        assert_eq!(manager.entries.len(), 1);
        assert_eq!(manager.status(&key), Some(true));
        let entry = &manager.entries[&key];
        assert_eq!(entry.address, LOCALHOST);
        assert_eq!(*entry.config, changed);
        assert!(!entry.cancel.is_cancelled());
        assert!(!entry.task.is_finished());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn initial_probes_run_concurrently() {
        // Connections are accepted by the kernel but never answered, so every probe times out.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut manager = MonitorManager::new();
        manager
            .insert(MonitorConfig {
                interval: Duration::from_secs(10),
                timeout: Duration::from_millis(300),
                probe: Probe::Http {
                    port,
                    path: "/".to_string(),
                    host: None,
                    expect_status: None,
                },
                ..make_config(port, 1, 1)
            })
            .await;

        let registrations: Vec<Registration> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|endpoint| Registration {
                key: make_key(endpoint),
                address: LOCALHOST,
                health: Health::new(true),
            })
            .collect();
        let started = tokio::time::Instant::now();
        manager
            .register_endpoints(registrations.clone())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
        for registration in &registrations {
            assert!(!registration.health.is_up());
        }
        assert_eq!(manager.statuses().len(), 5);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_registration_starts_nothing() {
        let port = closed_port().await;
        let mut manager = MonitorManager::new();
        manager.insert(make_config(port, 1000, 1000)).await;
        let registrations = vec![
            Registration {
                key: make_key("a"),
                address: LOCALHOST,
                health: Health::default(),
            },
            Registration {
                key: EntryKey {
                    monitor: "missing".to_string(),
                    ..make_key("b")
                },
                address: LOCALHOST,
                health: Health::default(),
            },
        ];
        assert!(matches!(
            manager.register_endpoints(registrations).await,
            Err(Error::MonitorUndefined(name)) if name == "missing"
        ));
        assert!(manager.statuses().is_empty());
    }

    #[tokio::test]
    async fn snapshot_seeds_recreated_entries() {
        let port = closed_port().await;
        let mut manager = MonitorManager::new();
        manager.insert(make_config(port, 1000, 1000)).await;

        let key = make_key("a");
        let health = Health::new(true);
        manager
            .register_endpoint(key.clone(), LOCALHOST, health.clone())
            .await
            .unwrap();
        health.set(true);
        manager.snapshot_statuses();

        assert!(manager.unregister_endpoint(&key).await);
        let recreated = Health::new(false);
        manager
            .register_endpoint(key.clone(), LOCALHOST, recreated.clone())
            .await
            .unwrap();
        assert!(recreated.is_up());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unregistering_stops_probing() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut manager = MonitorManager::new();
        manager.insert(make_config(port, 1, 1)).await;

        let key = make_key("a");
        let health = Health::new(false);
        manager
            .register_endpoint(key.clone(), LOCALHOST, health.clone())
            .await
            .unwrap();
        assert!(health.is_up());
        assert!(manager.unregister_endpoint(&key).await);
        assert!(!manager.unregister_endpoint(&key).await);
        assert_eq!(manager.status(&key), None);

        // With the loop gone, closing the port can no longer bring the endpoint down.
        drop(listener);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(health.is_up());
    }

    #[tokio::test]
    async fn probe_loop_publishes_transitions() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut manager = MonitorManager::new();
        manager.insert(make_config(port, 1, 2)).await;

        let health = Health::new(false);
        manager
            .register_endpoint(make_key("a"), LOCALHOST, health.clone())
            .await
            .unwrap();
        assert!(health.is_up());

        drop(listener);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while health.is_up() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!health.is_up());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_monitor_is_rejected() {
        let mut manager = MonitorManager::new();
        let err = manager
            .register_endpoint(make_key("a"), LOCALHOST, Health::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MonitorUndefined(name) if name == "web"));
    }

    #[tokio::test]
    async fn reconcile_and_prune() {
        let backend = Arc::new(InMemoryBackend::new());
        backend
            .put(
                Kind::Monitor,
                "web",
                "interval: 10\nprobe: { type: tcp, port: 80 }\n",
            )
            .await;
        backend.put(Kind::Monitor, "broken", "interval: [").await;
        let backends: Vec<DynBackend> = vec![backend.clone()];

        let mut manager = MonitorManager::new();
        let failures = manager.reconcile(&backends).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "broken");
        assert!(manager.contains("web"));
        assert!(!manager.contains("broken"));

        // Unchanged monitors aren't reloaded.
        let loaded = manager.get("web").cloned().unwrap();
        manager.reconcile(&backends).await;
        assert!(Arc::ptr_eq(&loaded, manager.get("web").unwrap()));

        backend.remove(Kind::Monitor, "web").await;
        manager.reconcile(&backends).await;
        manager.prune();
        assert!(!manager.contains("web"));
    }

    #[tokio::test]
    async fn prune_defers_monitors_in_use() {
        let port = closed_port().await;
        let backend = Arc::new(InMemoryBackend::new());
        let backends: Vec<DynBackend> = vec![backend];

        let mut manager = MonitorManager::new();
        manager.insert(make_config(port, 1000, 1000)).await;
        let key = make_key("a");
        manager
            .register_endpoint(key.clone(), LOCALHOST, Health::default())
            .await
            .unwrap();

        manager.reconcile(&backends).await;
        manager.prune();
        assert!(manager.contains("web"));

        manager.unregister_endpoint(&key).await;
        manager.prune();
        assert!(!manager.contains("web"));
    }
}
