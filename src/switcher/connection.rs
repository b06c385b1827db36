//! Device connection lifecycle
//!
//! One [`Connection`] per switcher address. It owns the live link and the
//! per-session callback registrations, and drives the
//! Disconnected → Connecting → Connected cycle. Every transition runs under
//! the connection's own async lock. Observable fields (state, activity,
//! retry count) are readable without that lock.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::callback;
use super::device::{
    CallbackId, MixEffectBlock, Switcher, SwitcherDiscovery, SwitcherInput, DEFAULT_FRAME_RATE,
};
use super::events::{EventBus, SubscriptionId};
use super::store::StateStore;
use super::types::{CapabilitySnapshot, InputInfo};
use crate::error::DeviceError;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Bounds automatic reconnection
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Reconnect attempts allowed before giving up until reset
    pub max_retries: u32,
    /// Delay between teardown and the new connect
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// A callback registered on a block, with the block handle it was registered on
struct CallbackRegistration {
    mix_effect: usize,
    id: CallbackId,
    block: Box<dyn MixEffectBlock>,
}

/// State only touched under the connection lock
#[derive(Default)]
struct Session {
    registrations: Vec<CallbackRegistration>,
}

/// Connection to one switcher
pub struct Connection {
    address: String,
    discovery: Arc<dyn SwitcherDiscovery>,
    store: Arc<StateStore>,
    policy: RetryPolicy,

    session: tokio::sync::Mutex<Session>,
    state: RwLock<ConnectionState>,
    link: RwLock<Option<Arc<dyn Switcher>>>,
    last_activity: Mutex<Instant>,
    retry_count: AtomicU32,
    state_events: EventBus<bool>,
    disposed: AtomicBool,
    reconnect_in_flight: AtomicBool,
}

impl Connection {
    pub fn new(
        address: &str,
        discovery: Arc<dyn SwitcherDiscovery>,
        store: Arc<StateStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            address: address.to_string(),
            discovery,
            store,
            policy,
            session: tokio::sync::Mutex::new(Session::default()),
            state: RwLock::new(ConnectionState::Disconnected),
            link: RwLock::new(None),
            last_activity: Mutex::new(Instant::now()),
            retry_count: AtomicU32::new(0),
            state_events: EventBus::new(),
            disposed: AtomicBool::new(false),
            reconnect_in_flight: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Re-arm automatic reconnection after the retry cap was hit
    pub fn reset_retries(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
        debug!(address = %self.address, "Retry count reset");
    }

    /// The live link, if connected
    ///
    /// Every call counts as activity, connected or not, so a switcher that
    /// consumers keep asking for is not retired while it is down.
    pub fn live_link(&self) -> Option<Arc<dyn Switcher>> {
        self.touch();
        self.link.read().clone()
    }

    /// Be told `true` on connect and `false` on disconnect or failed connect
    pub fn subscribe_state<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.state_events.subscribe(move |connected: &bool| handler(*connected))
    }

    pub fn unsubscribe_state(&self, id: SubscriptionId) -> bool {
        self.state_events.unsubscribe(id)
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Open the link and populate the caches
    ///
    /// Returns true when connected. A call made while already connected
    /// succeeds without doing anything; concurrent calls are serialized by
    /// the connection lock, so only the first one opens a link.
    pub async fn connect(&self) -> bool {
        let mut session = self.session.lock().await;

        if self.is_connected() {
            return true;
        }
        if self.disposed.load(Ordering::SeqCst) {
            debug!(address = %self.address, "Connection disposed, not connecting");
            return false;
        }

        self.set_state(ConnectionState::Connecting);
        info!(address = %self.address, "🎬 Connecting to switcher");

        let discovery = Arc::clone(&self.discovery);
        let address = self.address.clone();
        let opened = tokio::task::spawn_blocking(move || discovery.connect_to(&address)).await;

        let link: Arc<dyn Switcher> = match opened {
            Ok(Ok(link)) => Arc::from(link),
            Ok(Err(e)) => {
                warn!(address = %self.address, "Failed to connect: {}", e);
                self.set_state(ConnectionState::Disconnected);
                self.state_events.publish(&false);
                return false;
            },
            Err(e) => {
                error!(address = %self.address, "Connect task failed: {}", e);
                self.set_state(ConnectionState::Disconnected);
                self.state_events.publish(&false);
                return false;
            },
        };

        // Released while the link call ran: the caches may belong to a newer connection now
        if self.disposed.load(Ordering::SeqCst) {
            debug!(address = %self.address, "Connection disposed during connect, dropping link");
            self.set_state(ConnectionState::Disconnected);
            return false;
        }

        self.retry_count.store(0, Ordering::SeqCst);
        self.touch();

        self.store
            .set_frame_rate(&self.address, read_frame_rate(link.as_ref(), &self.address));

        let blocks = enumerate_blocks(link.as_ref(), &self.address);
        self.store.set_capabilities(snapshot_capabilities(
            link.as_ref(),
            &self.address,
            blocks.len(),
        ));

        for (index, block) in blocks {
            if let Err(e) =
                callback::initialize_state(&self.store, &self.address, index, block.as_ref())
            {
                warn!(address = %self.address, mix_effect = index, "Failed to read initial state: {}", e);
            }

            let handler =
                callback::mix_effect_callback(Arc::downgrade(&self.store), self.address.clone(), index);
            match block.add_callback(handler) {
                Ok(id) => session.registrations.push(CallbackRegistration {
                    mix_effect: index,
                    id,
                    block,
                }),
                Err(e) => {
                    warn!(address = %self.address, mix_effect = index, "Failed to register callback: {}", e);
                },
            }
        }

        *self.link.write() = Some(link);
        self.set_state(ConnectionState::Connected);
        info!(
            address = %self.address,
            "✅ Switcher connected ({} callbacks registered)",
            session.registrations.len()
        );
        self.state_events.publish(&true);
        true
    }

    /// Tear down the session. No-op (and no notification) when not connected.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if self.teardown(&mut session) {
            info!(address = %self.address, "Switcher disconnected");
            self.state_events.publish(&false);
        }
    }

    /// Disconnect, wait the backoff, connect again
    ///
    /// Fails immediately, without touching the device, once the retry cap is
    /// reached. The count only goes back to zero on a successful connect or
    /// [`reset_retries`](Self::reset_retries).
    pub async fn reconnect(&self) -> bool {
        let cap = self.policy.max_retries;
        let attempt = match self.retry_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < cap).then_some(n + 1)
        }) {
            Ok(previous) => previous + 1,
            Err(_) => {
                warn!(address = %self.address, "Max retries reached ({}), not reconnecting", cap);
                return false;
            },
        };

        info!(address = %self.address, "🔄 Reconnecting (attempt {}/{})", attempt, cap);
        self.disconnect().await;
        sleep(self.policy.backoff).await;
        self.connect().await
    }

    /// Run [`reconnect`](Self::reconnect) in the background
    ///
    /// At most one background reconnect per connection is in flight.
    pub fn spawn_reconnect(self: &Arc<Self>, runtime: &Handle) {
        if self.reconnect_in_flight.swap(true, Ordering::SeqCst) {
            debug!(address = %self.address, "Reconnect already in flight");
            return;
        }
        let connection = Arc::clone(self);
        runtime.spawn(async move {
            connection.reconnect().await;
            connection.reconnect_in_flight.store(false, Ordering::SeqCst);
        });
    }

    /// Final teardown. The connection never connects again afterwards.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let mut session = self.session.lock().await;
        if self.teardown(&mut session) {
            self.state_events.publish(&false);
        }
        self.state_events.clear();
        debug!(address = %self.address, "Connection disposed");
    }

    /// Unregister callbacks, release block handles, then release the link
    ///
    /// Returns whether the connection was connected. A failing unregister is
    /// logged and the remaining resources are still released.
    fn teardown(&self, session: &mut Session) -> bool {
        let was_connected = self.is_connected();

        for registration in session.registrations.drain(..) {
            if let Err(e) = registration.block.remove_callback(registration.id) {
                warn!(
                    address = %self.address,
                    mix_effect = registration.mix_effect,
                    "Failed to unregister callback: {}", e
                );
            }
        }

        let link = self.link.write().take();
        drop(link);
        self.set_state(ConnectionState::Disconnected);
        was_connected
    }
}

fn read_frame_rate(link: &dyn Switcher, address: &str) -> f64 {
    match link.video_mode() {
        Ok(mode) => mode.frame_rate_or_default(),
        Err(e) => {
            warn!(address, "Failed to read video mode, using {} fps: {}", DEFAULT_FRAME_RATE, e);
            DEFAULT_FRAME_RATE
        },
    }
}

/// Enumerate blocks once, keeping device indices. Failed items are skipped.
fn enumerate_blocks(link: &dyn Switcher, address: &str) -> Vec<(usize, Box<dyn MixEffectBlock>)> {
    let iter = match link.mix_effect_blocks() {
        Ok(iter) => iter,
        Err(e) => {
            warn!(address, "Failed to enumerate mix effect blocks: {}", e);
            return Vec::new();
        },
    };

    iter.enumerate()
        .filter_map(|(index, item)| match item {
            Ok(block) => Some((index, block)),
            Err(e) => {
                warn!(address, mix_effect = index, "Skipping mix effect block: {}", e);
                None
            },
        })
        .collect()
}

fn read_input(input: &dyn SwitcherInput) -> Result<InputInfo, DeviceError> {
    Ok(InputInfo {
        id: input.input_id()?,
        short_name: input.short_name()?,
        long_name: input.long_name()?,
    })
}

fn snapshot_capabilities(
    link: &dyn Switcher,
    address: &str,
    mix_effect_count: usize,
) -> CapabilitySnapshot {
    let mut inputs: Vec<InputInfo> = match link.inputs() {
        Ok(iter) => iter
            .filter_map(|item| match item.and_then(|input| read_input(input.as_ref())) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(address, "Skipping input: {}", e);
                    None
                },
            })
            .collect(),
        Err(e) => {
            warn!(address, "Failed to enumerate inputs: {}", e);
            Vec::new()
        },
    };
    inputs.sort_by_key(|input| input.id);

    CapabilitySnapshot {
        address: address.to_string(),
        mix_effect_count: mix_effect_count.max(1),
        input_count: inputs.len(),
        inputs,
        last_updated: Some(chrono::Utc::now()),
    }
}
