//! StateStore - per-switcher caches shared by connections and consumers
//!
//! Holds the capability snapshot, frame rate and mix-effect state of every
//! known switcher, plus the global change-event bus. All maps are DashMaps so
//! reads never go through a process-wide lock.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::device::DEFAULT_FRAME_RATE;
use super::events::{EventBus, SubscriptionId};
use super::types::{CapabilitySnapshot, StateChangeEvent, SwitcherState};

/// Caches keyed by switcher address
#[derive(Default)]
pub struct StateStore {
    capabilities: DashMap<String, Arc<CapabilitySnapshot>>,
    frame_rates: DashMap<String, f64>,
    switchers: DashMap<String, Arc<SwitcherState>>,
    events: EventBus<StateChangeEvent>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached capabilities, or an unpopulated snapshot if none yet
    pub fn capabilities(&self, address: &str) -> Arc<CapabilitySnapshot> {
        self.capabilities
            .get(address)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::new(CapabilitySnapshot::empty(address)))
    }

    /// Replace the snapshot for its address
    pub fn set_capabilities(&self, snapshot: CapabilitySnapshot) {
        info!(
            address = %snapshot.address,
            "Cached switcher capabilities: {} ME blocks, {} inputs",
            snapshot.mix_effect_count, snapshot.input_count
        );
        self.capabilities
            .insert(snapshot.address.clone(), Arc::new(snapshot));
    }

    pub fn frame_rate(&self, address: &str) -> f64 {
        self.frame_rates
            .get(address)
            .map(|entry| *entry.value())
            .unwrap_or(DEFAULT_FRAME_RATE)
    }

    pub fn set_frame_rate(&self, address: &str, fps: f64) {
        info!(address, "Cached framerate: {} fps", fps);
        self.frame_rates.insert(address.to_string(), fps);
    }

    /// Mix-effect states for `address`, created on first access
    pub fn switcher_state(&self, address: &str) -> Arc<SwitcherState> {
        if let Some(existing) = self.switchers.get(address) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.switchers
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(SwitcherState::new(address)))
                .value(),
        )
    }

    /// Drop every cache entry for `address`
    pub fn remove(&self, address: &str) {
        self.capabilities.remove(address);
        self.frame_rates.remove(address);
        self.switchers.remove(address);
        debug!(address, "Cleared cached switcher state");
    }

    pub fn clear(&self) {
        self.capabilities.clear();
        self.frame_rates.clear();
        self.switchers.clear();
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StateChangeEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn publish(&self, event: &StateChangeEvent) {
        self.events.publish(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switcher::types::{EventKind, StateValue};
    use chrono::Utc;

    #[test]
    fn test_defaults_when_absent() {
        let store = StateStore::new();

        assert!(!store.capabilities("10.0.0.9").is_populated());
        assert_eq!(store.frame_rate("10.0.0.9"), DEFAULT_FRAME_RATE);
        assert!(store.switcher_state("10.0.0.9").indices().is_empty());
    }

    #[test]
    fn test_capabilities_replaced_wholesale() {
        let store = StateStore::new();
        let mut snapshot = CapabilitySnapshot::empty("10.0.0.1");
        snapshot.mix_effect_count = 2;
        snapshot.last_updated = Some(Utc::now());
        store.set_capabilities(snapshot);

        let mut second = CapabilitySnapshot::empty("10.0.0.1");
        second.last_updated = Some(Utc::now());
        store.set_capabilities(second);

        assert_eq!(store.capabilities("10.0.0.1").mix_effect_count, 1);
    }

    #[test]
    fn test_remove_clears_every_cache() {
        let store = StateStore::new();
        let mut snapshot = CapabilitySnapshot::empty("10.0.0.1");
        snapshot.last_updated = Some(Utc::now());
        store.set_capabilities(snapshot);
        store.set_frame_rate("10.0.0.1", 50.0);
        store.switcher_state("10.0.0.1").mix_effect(0).update(|s| s.preview_input = 3);

        store.remove("10.0.0.1");

        assert!(!store.capabilities("10.0.0.1").is_populated());
        assert_eq!(store.frame_rate("10.0.0.1"), DEFAULT_FRAME_RATE);
        assert_eq!(store.switcher_state("10.0.0.1").mix_effect_state(0).preview_input, 0);
    }

    #[test]
    fn test_switcher_state_is_shared_per_address() {
        let store = StateStore::new();
        let a = store.switcher_state("10.0.0.1");
        let b = store.switcher_state("10.0.0.1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_publish_goes_through_bus() {
        let store = StateStore::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let id = store.subscribe(move |event| seen_clone.lock().push(event.kind));

        store.publish(&StateChangeEvent {
            address: "10.0.0.1".to_string(),
            mix_effect: 0,
            kind: EventKind::ProgramInputChanged,
            old_value: StateValue::Input(1),
            new_value: StateValue::Input(2),
        });

        assert!(store.unsubscribe(id));
        assert_eq!(*seen.lock(), vec![EventKind::ProgramInputChanged]);
    }
}
