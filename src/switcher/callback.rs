//! Device callback translation
//!
//! Turns a mix-effect notification into a cache update plus a
//! [`StateChangeEvent`]. Values are always re-read from the block; the
//! notification only says which field set to refresh.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace};

use super::device::{MixEffectBlock, MixEffectCallback, MixEffectEventType};
use super::store::StateStore;
use super::types::{EventKind, MixEffectState, StateChangeEvent, StateValue};
use crate::error::DeviceError;

impl EventKind {
    /// Map a device event to a cached-state event kind
    ///
    /// Returns `None` for kinds that do not touch the cache.
    pub fn from_device(event: MixEffectEventType) -> Option<Self> {
        match event {
            MixEffectEventType::InTransitionChanged => Some(EventKind::TransitionStateChanged),
            MixEffectEventType::TransitionPositionChanged => {
                Some(EventKind::TransitionPositionChanged)
            },
            MixEffectEventType::ProgramInputChanged => Some(EventKind::ProgramInputChanged),
            MixEffectEventType::PreviewInputChanged => Some(EventKind::PreviewInputChanged),
            _ => None,
        }
    }
}

/// Build the callback registered on one block during a connected session
///
/// Holds only a weak reference to the store, so the store stays the single
/// owner of cached state and the callback can outlive it harmlessly.
pub(crate) fn mix_effect_callback(
    store: Weak<StateStore>,
    address: String,
    mix_effect: usize,
) -> MixEffectCallback {
    Arc::new(move |block: &dyn MixEffectBlock, event: MixEffectEventType| {
        let Some(store) = store.upgrade() else {
            trace!(address = %address, mix_effect, "State store gone, ignoring {:?}", event);
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            translate(&store, &address, mix_effect, block, event)
        }));

        match outcome {
            Ok(Ok(Some(change))) => store.publish(&change),
            Ok(Ok(None)) => {},
            Ok(Err(e)) => {
                error!(address = %address, mix_effect, "Error in mix effect callback: {}", e);
            },
            Err(_) => {
                error!(address = %address, mix_effect, "Mix effect callback panicked on {:?}", event);
            },
        }
    })
}

/// Refresh the cached field set named by `event` from `block`
///
/// Returns the change to publish, or `None` for ignored event kinds.
pub fn translate(
    store: &StateStore,
    address: &str,
    mix_effect: usize,
    block: &dyn MixEffectBlock,
    event: MixEffectEventType,
) -> Result<Option<StateChangeEvent>, DeviceError> {
    let Some(kind) = EventKind::from_device(event) else {
        return Ok(None);
    };

    let cell = store.switcher_state(address).mix_effect(mix_effect);

    let (old_value, new_value) = match kind {
        EventKind::TransitionStateChanged => {
            let in_transition = block.in_transition()?;
            let was = cell.update(|s| std::mem::replace(&mut s.in_transition, in_transition));
            info!(
                address,
                mix_effect,
                "ME {} transition state changed: {}",
                mix_effect,
                if in_transition { "IN TRANSITION" } else { "IDLE" }
            );
            (StateValue::Bool(was), StateValue::Bool(in_transition))
        },
        EventKind::TransitionPositionChanged => {
            let position = block.transition_position()?;
            let was = cell.update(|s| std::mem::replace(&mut s.transition_position, position));
            (StateValue::Position(was), StateValue::Position(position))
        },
        EventKind::ProgramInputChanged => {
            let program = block.program_input()?;
            let was = cell.update(|s| std::mem::replace(&mut s.program_input, program));
            info!(address, mix_effect, "ME {} program input changed: {} -> {}", mix_effect, was, program);
            (StateValue::Input(was), StateValue::Input(program))
        },
        EventKind::PreviewInputChanged => {
            let preview = block.preview_input()?;
            let was = cell.update(|s| std::mem::replace(&mut s.preview_input, preview));
            info!(address, mix_effect, "ME {} preview input changed: {} -> {}", mix_effect, was, preview);
            (StateValue::Input(was), StateValue::Input(preview))
        },
    };

    Ok(Some(StateChangeEvent {
        address: address.to_string(),
        mix_effect,
        kind,
        old_value,
        new_value,
    }))
}

/// Read every field of `block` once and store it as the cached state
pub fn initialize_state(
    store: &StateStore,
    address: &str,
    mix_effect: usize,
    block: &dyn MixEffectBlock,
) -> Result<MixEffectState, DeviceError> {
    let state = MixEffectState {
        in_transition: block.in_transition()?,
        transition_position: block.transition_position()?,
        program_input: block.program_input()?,
        preview_input: block.preview_input()?,
    };

    store
        .switcher_state(address)
        .mix_effect(mix_effect)
        .replace(state);

    debug!(
        address,
        mix_effect,
        "Initialized ME {}: Program={}, Preview={}",
        mix_effect,
        state.program_input,
        state.preview_input
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switcher::simulator::SimulatedSwitcher;

    const ADDR: &str = "10.0.0.1";

    fn capture(store: &StateStore) -> Arc<parking_lot::Mutex<Vec<StateChangeEvent>>> {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        store.subscribe(move |event| seen_clone.lock().push(event.clone()));
        seen
    }

    #[test]
    fn test_program_change_updates_cache_and_publishes() {
        let store = Arc::new(StateStore::new());
        let seen = capture(&store);
        let device = SimulatedSwitcher::new(1, 4);
        device.mutate(0, |s| s.program_input = 3);

        let callback = mix_effect_callback(Arc::downgrade(&store), ADDR.to_string(), 0);
        let block = device.device_view(0).expect("block 0");
        callback(&block, MixEffectEventType::ProgramInputChanged);

        assert_eq!(store.switcher_state(ADDR).mix_effect_state(0).program_input, 3);
        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ProgramInputChanged);
        assert_eq!(events[0].old_value, StateValue::Input(0));
        assert_eq!(events[0].new_value, StateValue::Input(3));
        assert!(events[0].concerns(ADDR, 0));
    }

    #[test]
    fn test_each_kind_touches_only_its_field() {
        let store = StateStore::new();
        let device = SimulatedSwitcher::new(1, 4);
        device.mutate(0, |s| {
            s.in_transition = true;
            s.transition_position = 0.4;
            s.program_input = 2;
            s.preview_input = 1;
        });
        let block = device.device_view(0).expect("block 0");

        translate(&store, ADDR, 0, &block, MixEffectEventType::TransitionPositionChanged)
            .expect("translate");
        let cached = store.switcher_state(ADDR).mix_effect_state(0);
        assert_eq!(cached.transition_position, 0.4);
        assert!(!cached.in_transition);
        assert_eq!(cached.program_input, 0);

        translate(&store, ADDR, 0, &block, MixEffectEventType::InTransitionChanged)
            .expect("translate");
        translate(&store, ADDR, 0, &block, MixEffectEventType::PreviewInputChanged)
            .expect("translate");
        let cached = store.switcher_state(ADDR).mix_effect_state(0);
        assert!(cached.in_transition);
        assert_eq!(cached.preview_input, 1);
        assert_eq!(cached.program_input, 0);
    }

    #[test]
    fn test_unknown_kinds_are_ignored() {
        let store = Arc::new(StateStore::new());
        let seen = capture(&store);
        let device = SimulatedSwitcher::new(1, 4);
        let block = device.device_view(0).expect("block 0");

        for event in [
            MixEffectEventType::TransitionFramesRemainingChanged,
            MixEffectEventType::PreviewLiveChanged,
            MixEffectEventType::Other(77),
        ] {
            let result = translate(&store, ADDR, 0, &block, event).expect("no error");
            assert!(result.is_none());
        }

        assert!(seen.lock().is_empty());
        assert!(store.switcher_state(ADDR).indices().is_empty());
    }

    #[test]
    fn test_value_is_read_from_block_not_trusted() {
        let store = StateStore::new();
        let device = SimulatedSwitcher::new(1, 4);
        let block = device.device_view(0).expect("block 0");

        // Two changes happened, only the first notification arrives late
        device.mutate(0, |s| s.preview_input = 2);
        device.mutate(0, |s| s.preview_input = 4);
        let change = translate(&store, ADDR, 0, &block, MixEffectEventType::PreviewInputChanged)
            .expect("translate")
            .expect("event");

        assert_eq!(change.new_value, StateValue::Input(4));
    }

    #[test]
    fn test_read_failure_is_absorbed_and_channel_survives() {
        let store = Arc::new(StateStore::new());
        let seen = capture(&store);
        let device = SimulatedSwitcher::new(1, 4);
        let callback = mix_effect_callback(Arc::downgrade(&store), ADDR.to_string(), 0);
        let block = device.device_view(0).expect("block 0");

        device.set_fail_reads(true);
        callback(&block, MixEffectEventType::ProgramInputChanged);
        assert!(seen.lock().is_empty());

        device.set_fail_reads(false);
        device.mutate(0, |s| s.program_input = 5);
        callback(&block, MixEffectEventType::ProgramInputChanged);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_callback_after_store_dropped_is_noop() {
        let store = Arc::new(StateStore::new());
        let callback = mix_effect_callback(Arc::downgrade(&store), ADDR.to_string(), 0);
        drop(store);

        let device = SimulatedSwitcher::new(1, 4);
        let block = device.device_view(0).expect("block 0");
        callback(&block, MixEffectEventType::ProgramInputChanged);
    }

    #[test]
    fn test_initialize_state_reads_all_fields() {
        let store = StateStore::new();
        let device = SimulatedSwitcher::new(2, 4);
        device.mutate(1, |s| {
            s.program_input = 4;
            s.preview_input = 2;
            s.transition_position = 0.0;
        });
        let block = device.device_view(1).expect("block 1");

        let state = initialize_state(&store, ADDR, 1, &block).expect("initialize");
        assert_eq!(state.program_input, 4);
        assert_eq!(store.switcher_state(ADDR).mix_effect_state(1), state);
    }
}
