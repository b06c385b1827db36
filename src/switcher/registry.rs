//! Connection registry
//!
//! Process-wide directory of [`Connection`]s keyed by address, plus the
//! caches they populate. A background sweep retires connections that stayed
//! disconnected and idle too long and nudges the others to reconnect.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionState, RetryPolicy};
use super::device::SwitcherDiscovery;
use super::events::SubscriptionId;
use super::info::CapabilityReport;
use super::store::StateStore;
use super::types::{CapabilitySnapshot, StateChangeEvent, SwitcherState};

/// Timing and retry settings for the registry and its connections
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
    pub max_retries: u32,
    pub reconnect_backoff: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_retries: 3,
            reconnect_backoff: Duration::from_secs(2),
        }
    }
}

impl RegistrySettings {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.reconnect_backoff,
        }
    }
}

/// Directory of switcher connections
pub struct ConnectionRegistry {
    discovery: Arc<dyn SwitcherDiscovery>,
    settings: RegistrySettings,
    connections: DashMap<String, Arc<Connection>>,
    store: Arc<StateStore>,
    runtime: Handle,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry bound to the current tokio runtime
    ///
    /// Must be called from within a runtime. Call [`start`](Self::start) to
    /// run the sweep.
    pub fn new(discovery: Arc<dyn SwitcherDiscovery>, settings: RegistrySettings) -> Self {
        Self {
            discovery,
            settings,
            connections: DashMap::new(),
            store: Arc::new(StateStore::new()),
            runtime: Handle::current(),
            sweep_task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Existing connection for `address`, or a new one that starts connecting
    ///
    /// Concurrent callers for the same address all get the same instance and
    /// only one initial connect is started.
    pub fn get_or_create(&self, address: &str) -> Arc<Connection> {
        if let Some(existing) = self.connections.get(address) {
            return Arc::clone(existing.value());
        }

        let mut created = false;
        let connection = Arc::clone(
            self.connections
                .entry(address.to_string())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Connection::new(
                        address,
                        Arc::clone(&self.discovery),
                        Arc::clone(&self.store),
                        self.settings.retry_policy(),
                    ))
                })
                .value(),
        );

        if created {
            info!(address, "Registered switcher connection");
            let pending = Arc::clone(&connection);
            self.runtime.spawn(async move {
                pending.connect().await;
            });
        }
        connection
    }

    /// Look up without creating
    pub fn get(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections.get(address).map(|c| Arc::clone(c.value()))
    }

    /// Addresses currently in the directory, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        addresses.sort();
        addresses
    }

    /// Remove and dispose the connection and every cache entry for `address`
    ///
    /// Disposal waits for an in-flight connect. If a new connection for the
    /// same address was registered meanwhile, the caches are left to it.
    pub async fn release(&self, address: &str) {
        if let Some((_, connection)) = self.connections.remove(address) {
            connection.dispose().await;
            info!(address, "Released switcher connection");
        } else {
            debug!(address, "Release requested for unknown switcher");
        }
        self.clear_caches_if_unused(address);
    }

    fn clear_caches_if_unused(&self, address: &str) {
        if self.connections.contains_key(address) {
            debug!(address, "Switcher re-registered during release, keeping caches");
            return;
        }
        self.store.remove(address);
    }

    pub fn capabilities(&self, address: &str) -> Arc<CapabilitySnapshot> {
        self.store.capabilities(address)
    }

    pub fn frame_rate(&self, address: &str) -> f64 {
        self.store.frame_rate(address)
    }

    pub fn switcher_state(&self, address: &str) -> Arc<SwitcherState> {
        self.store.switcher_state(address)
    }

    pub fn capability_report(&self, address: &str) -> Option<CapabilityReport> {
        CapabilityReport::from_snapshot(&self.store.capabilities(address))
    }

    /// Receive every [`StateChangeEvent`], for all switchers
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StateChangeEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Spawn the periodic sweep. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.sweep_task.lock();
        if task.is_some() {
            return;
        }

        let registry = Arc::downgrade(self);
        let period = self.settings.sweep_interval;
        *task = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep_once().await;
            }
        }));
        info!("Connection monitor started (every {:?})", period);
    }

    /// One sweep pass
    ///
    /// Disconnected connections idle longer than the timeout are released;
    /// other disconnected ones get a background reconnect. Connecting and
    /// connected ones are left alone.
    pub async fn sweep_once(&self) {
        let snapshot: Vec<(String, Arc<Connection>)> = self
            .connections
            .iter()
            .map(|c| (c.key().clone(), Arc::clone(c.value())))
            .collect();

        for (address, connection) in snapshot {
            if connection.state() != ConnectionState::Disconnected {
                continue;
            }

            if connection.idle_for() > self.settings.idle_timeout {
                let removed = self.connections.remove_if(&address, |_, current| {
                    Arc::ptr_eq(current, &connection)
                        && current.state() == ConnectionState::Disconnected
                });
                if removed.is_some() {
                    info!(address = %address, "Removing idle switcher connection");
                    connection.dispose().await;
                    self.clear_caches_if_unused(&address);
                }
            } else {
                connection.spawn_reconnect(&self.runtime);
            }
        }
    }

    /// Stop the sweep and dispose every connection and cache entry
    pub async fn shutdown(&self) {
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }

        for address in self.addresses() {
            if let Some((_, connection)) = self.connections.remove(&address) {
                connection.dispose().await;
            }
        }
        self.store.clear();
        info!("Connection registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::switcher::device::{MixEffectEventType, Switcher};
    use crate::switcher::simulator::{SimulatedDiscovery, SimulatedSwitcher};
    use std::sync::atomic::{AtomicBool, Ordering};

    const ADDR: &str = "10.0.0.1";
    const OTHER: &str = "10.0.0.2";

    fn registry_with(discovery: &Arc<SimulatedDiscovery>) -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(
            discovery.clone(),
            RegistrySettings::default(),
        ))
    }

    /// Wait until `attempts` connects were made and none is in progress
    async fn settle(discovery: &SimulatedDiscovery, connection: &Connection, attempts: usize) {
        for _ in 0..500 {
            if discovery.connect_attempts_for(connection.address()) >= attempts
                && connection.state() != ConnectionState::Connecting
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection to {} did not settle", connection.address());
    }

    async fn wait_connected(connection: &Connection) {
        for _ in 0..500 {
            if connection.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection to {} never connected", connection.address());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_share_one_connection() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        discovery.add_device(ADDR, SimulatedSwitcher::new(1, 4));
        let registry = registry_with(&discovery);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create(ADDR) })
            })
            .collect();

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.expect("task"));
        }

        for connection in &connections[1..] {
            assert!(Arc::ptr_eq(connection, &connections[0]));
        }
        wait_connected(&connections[0]).await;
        assert_eq!(discovery.connect_attempts(), 1);
        assert_eq!(registry.addresses(), vec![ADDR.to_string()]);
    }

    #[tokio::test]
    async fn test_lookups_with_defaults() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        let registry = registry_with(&discovery);

        assert!(!registry.capabilities(ADDR).is_populated());
        assert_eq!(registry.frame_rate(ADDR), 25.0);
        assert!(registry.switcher_state(ADDR).indices().is_empty());
        assert!(registry.capability_report(ADDR).is_none());
        assert!(registry.get(ADDR).is_none());
    }

    #[tokio::test]
    async fn test_connect_fills_report() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        discovery.add_device(ADDR, SimulatedSwitcher::new(2, 3));
        let registry = registry_with(&discovery);

        wait_connected(&registry.get_or_create(ADDR)).await;

        let report = registry.capability_report(ADDR).expect("report");
        assert_eq!(report.mix_effect_count, 2);
        assert_eq!(report.input_count, 3);
        assert_eq!(report.inputs[0].display_name, "1: Camera 1 (CAM1)");
    }

    #[tokio::test]
    async fn test_release_disposes_and_clears_caches() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        let device = discovery.add_device(ADDR, SimulatedSwitcher::new(2, 4));
        let registry = registry_with(&discovery);
        let connection = registry.get_or_create(ADDR);
        wait_connected(&connection).await;

        registry.release(ADDR).await;
        registry.release(ADDR).await;

        assert!(registry.get(ADDR).is_none());
        assert!(!connection.is_connected());
        assert!(!registry.capabilities(ADDR).is_populated());
        assert_eq!(device.callback_count(), 0);
        assert_eq!(device.live_handles(), 0);
        assert_eq!(device.live_links(), 0);
    }

    #[tokio::test]
    async fn test_release_then_lookup_creates_fresh_connection() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        discovery.add_device(ADDR, SimulatedSwitcher::new(1, 2));
        let registry = registry_with(&discovery);
        let first = registry.get_or_create(ADDR);
        wait_connected(&first).await;

        registry.release(ADDR).await;
        let second = registry.get_or_create(ADDR);
        wait_connected(&second).await;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(discovery.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_retires_idle_and_reconnects_recent() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        discovery.add_device(ADDR, SimulatedSwitcher::new(1, 2));
        discovery.add_device(OTHER, SimulatedSwitcher::new(1, 2));
        discovery.set_reachable(ADDR, false);
        discovery.set_reachable(OTHER, false);
        let registry = registry_with(&discovery);

        let idle = registry.get_or_create(ADDR);
        settle(&discovery, &idle, 1).await;
        tokio::time::advance(Duration::from_secs(301)).await;

        let recent = registry.get_or_create(OTHER);
        settle(&discovery, &recent, 1).await;
        discovery.set_reachable(OTHER, true);

        registry.sweep_once().await;

        assert!(registry.get(ADDR).is_none());
        assert_eq!(discovery.connect_attempts_for(ADDR), 1);

        wait_connected(&recent).await;
        assert!(registry.get(OTHER).is_some());
        assert_eq!(discovery.connect_attempts_for(OTHER), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_down_switcher_that_is_still_used() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        discovery.add_device(ADDR, SimulatedSwitcher::new(1, 2));
        discovery.set_reachable(ADDR, false);
        let registry = registry_with(&discovery);

        let connection = registry.get_or_create(ADDR);
        settle(&discovery, &connection, 1).await;
        tokio::time::advance(Duration::from_secs(301)).await;

        // A button press against the dropped switcher
        assert!(connection.live_link().is_none());
        registry.sweep_once().await;

        assert!(registry.get(ADDR).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_leaves_connected_alone() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        discovery.add_device(ADDR, SimulatedSwitcher::new(1, 2));
        let registry = registry_with(&discovery);
        let connection = registry.get_or_create(ADDR);
        wait_connected(&connection).await;

        tokio::time::advance(Duration::from_secs(600)).await;
        registry.sweep_once().await;

        assert!(registry.get(ADDR).is_some());
        assert!(connection.is_connected());
        assert_eq!(discovery.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_sweep_recovers_dropped_switcher() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        discovery.add_device(ADDR, SimulatedSwitcher::new(1, 2));
        discovery.set_reachable(ADDR, false);
        let registry = registry_with(&discovery);
        registry.start();

        let connection = registry.get_or_create(ADDR);
        settle(&discovery, &connection, 1).await;
        discovery.set_reachable(ADDR, true);

        // One sweep interval plus the reconnect backoff
        tokio::time::sleep(Duration::from_secs(8)).await;
        wait_connected(&connection).await;
        assert_eq!(connection.retry_count(), 0);

        registry.shutdown().await;
    }

    /// Discovery whose first link call blocks before succeeding
    struct SlowFirstConnect {
        inner: SimulatedDiscovery,
        delayed: AtomicBool,
    }

    impl SwitcherDiscovery for SlowFirstConnect {
        fn connect_to(&self, address: &str) -> Result<Box<dyn Switcher>, DeviceError> {
            if !self.delayed.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(500));
            }
            self.inner.connect_to(address)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_during_connect_keeps_new_connection_caches() {
        let discovery = Arc::new(SlowFirstConnect {
            inner: SimulatedDiscovery::new(),
            delayed: AtomicBool::new(false),
        });
        let device = discovery
            .inner
            .add_device(ADDR, SimulatedSwitcher::new(2, 4));
        let registry = Arc::new(ConnectionRegistry::new(
            discovery.clone(),
            RegistrySettings::default(),
        ));

        let first = registry.get_or_create(ADDR);
        settle_on(|| first.state() == ConnectionState::Connecting).await;

        let releasing = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.release(ADDR).await })
        };
        settle_on(|| registry.get(ADDR).is_none()).await;

        let fresh = registry.get_or_create(ADDR);
        wait_connected(&fresh).await;
        releasing.await.expect("release task");

        assert!(!first.is_connected());
        assert!(fresh.is_connected());
        assert!(registry.capabilities(ADDR).is_populated());
        assert_eq!(registry.switcher_state(ADDR).indices(), vec![0, 1]);
        // The released connection dropped its link instead of registering callbacks
        assert_eq!(device.live_links(), 1);
        assert_eq!(device.callback_count(), 2);
    }

    async fn settle_on(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn test_shutdown_disposes_everything() {
        let discovery = Arc::new(SimulatedDiscovery::new());
        let first = discovery.add_device(ADDR, SimulatedSwitcher::new(2, 2));
        let second = discovery.add_device(OTHER, SimulatedSwitcher::new(1, 2));
        let registry = registry_with(&discovery);
        registry.start();
        wait_connected(&registry.get_or_create(ADDR)).await;
        wait_connected(&registry.get_or_create(OTHER)).await;

        registry.shutdown().await;

        assert!(registry.addresses().is_empty());
        assert_eq!(first.live_handles() + second.live_handles(), 0);
        assert_eq!(first.callback_count() + second.callback_count(), 0);

        // Callbacks are gone, so device activity no longer reaches the bus
        let hits = Arc::new(Mutex::new(0));
        let hits_clone = Arc::clone(&hits);
        registry.subscribe(move |_| *hits_clone.lock() += 1);
        first.emit(0, MixEffectEventType::ProgramInputChanged);
        assert_eq!(*hits.lock(), 0);
    }
}
