//! Cached switcher state types
//!
//! Capability snapshots, per mix-effect state and the change events
//! published when the device reports a new value.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use super::device::InputId;

/// Switcher input as enumerated at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    pub id: InputId,
    pub short_name: String,
    pub long_name: String,
}

impl InputInfo {
    /// Label shown in input pickers
    ///
    /// `"3: Camera 1 (Cam1)"` when both names exist and differ,
    /// `"4: Cam2"` when only the short name is useful, `"Input 5"` otherwise.
    pub fn display_name(&self) -> String {
        let has_short = !self.short_name.is_empty();
        let has_long = !self.long_name.is_empty();
        if has_short && has_long && self.long_name != self.short_name {
            format!("{}: {} ({})", self.id, self.long_name, self.short_name)
        } else if has_short {
            format!("{}: {}", self.id, self.short_name)
        } else {
            format!("Input {}", self.id)
        }
    }
}

/// What a switcher offers, captured on each successful connect
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilitySnapshot {
    pub address: String,
    pub mix_effect_count: usize,
    pub input_count: usize,
    /// Sorted by input id
    pub inputs: Vec<InputInfo>,
    /// `None` until the first successful connect
    pub last_updated: Option<DateTime<Utc>>,
}

impl CapabilitySnapshot {
    /// Placeholder returned before any data is known
    pub fn empty(address: &str) -> Self {
        Self {
            address: address.to_string(),
            mix_effect_count: 1,
            input_count: 0,
            inputs: Vec::new(),
            last_updated: None,
        }
    }

    /// Whether this snapshot came from a real connect
    pub fn is_populated(&self) -> bool {
        self.last_updated.is_some()
    }

    pub fn input(&self, id: InputId) -> Option<&InputInfo> {
        self.inputs.iter().find(|input| input.id == id)
    }
}

/// Current state of one mix-effect block
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MixEffectState {
    pub in_transition: bool,
    pub transition_position: f64,
    pub program_input: InputId,
    pub preview_input: InputId,
}

/// Shared cell holding a [`MixEffectState`]
///
/// Readers get a copy of the whole value; writers replace fields inside one
/// write lock, so no reader sees half of an update.
#[derive(Debug, Default)]
pub struct MixEffectCell {
    state: RwLock<MixEffectState>,
}

impl MixEffectCell {
    pub fn get(&self) -> MixEffectState {
        *self.state.read()
    }

    /// Apply `f` under the write lock and return what it returns
    pub fn update<R>(&self, f: impl FnOnce(&mut MixEffectState) -> R) -> R {
        let mut state = self.state.write();
        f(&mut state)
    }

    pub fn replace(&self, new_state: MixEffectState) -> MixEffectState {
        std::mem::replace(&mut *self.state.write(), new_state)
    }
}

/// All mix-effect states of one switcher, keyed by block index
#[derive(Debug)]
pub struct SwitcherState {
    address: String,
    mix_effects: DashMap<usize, Arc<MixEffectCell>>,
}

impl SwitcherState {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            mix_effects: DashMap::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get or lazily create the cell for `index`
    pub fn mix_effect(&self, index: usize) -> Arc<MixEffectCell> {
        Arc::clone(self.mix_effects.entry(index).or_default().value())
    }

    /// Copy of the state for `index` (created with defaults if unseen)
    pub fn mix_effect_state(&self, index: usize) -> MixEffectState {
        self.mix_effect(index).get()
    }

    /// Indices that have been touched so far, ascending
    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.mix_effects.iter().map(|e| *e.key()).collect();
        indices.sort_unstable();
        indices
    }
}

/// Kind of change carried by a [`StateChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TransitionStateChanged,
    TransitionPositionChanged,
    ProgramInputChanged,
    PreviewInputChanged,
}

/// Old or new value carried by a [`StateChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateValue {
    Bool(bool),
    Position(f64),
    Input(InputId),
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Bool(v) => write!(f, "{}", v),
            StateValue::Position(v) => write!(f, "{:.3}", v),
            StateValue::Input(v) => write!(f, "{}", v),
        }
    }
}

/// A cached value changed because the device reported it
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangeEvent {
    pub address: String,
    pub mix_effect: usize,
    pub kind: EventKind,
    pub old_value: StateValue,
    pub new_value: StateValue,
}

impl StateChangeEvent {
    /// Whether this event concerns the given switcher and block
    pub fn concerns(&self, address: &str, mix_effect: usize) -> bool {
        self.mix_effect == mix_effect && self.address == address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(id: InputId, short: &str, long: &str) -> InputInfo {
        InputInfo {
            id,
            short_name: short.to_string(),
            long_name: long.to_string(),
        }
    }

    #[test]
    fn test_display_name_rules() {
        assert_eq!(input(3, "Cam1", "Camera 1").display_name(), "3: Camera 1 (Cam1)");
        assert_eq!(input(4, "Cam2", "Cam2").display_name(), "4: Cam2");
        assert_eq!(input(5, "", "").display_name(), "Input 5");
        assert_eq!(input(6, "CAM6", "").display_name(), "6: CAM6");
        // A long name alone is not enough
        assert_eq!(input(7, "", "Camera 7").display_name(), "Input 7");
    }

    #[test]
    fn test_empty_snapshot_is_not_populated() {
        let snapshot = CapabilitySnapshot::empty("10.0.0.1");
        assert!(!snapshot.is_populated());
        assert_eq!(snapshot.mix_effect_count, 1);
        assert_eq!(snapshot.input_count, 0);
    }

    #[test]
    fn test_switcher_state_creates_lazily() {
        let state = SwitcherState::new("10.0.0.1");
        assert!(state.indices().is_empty());

        assert_eq!(state.mix_effect_state(2), MixEffectState::default());
        state.mix_effect(0).update(|s| s.program_input = 4);

        assert_eq!(state.indices(), vec![0, 2]);
        assert_eq!(state.mix_effect_state(0).program_input, 4);
        assert!(Arc::ptr_eq(&state.mix_effect(0), &state.mix_effect(0)));
    }

    #[test]
    fn test_cell_replace_returns_previous() {
        let cell = MixEffectCell::default();
        let new_state = MixEffectState {
            in_transition: true,
            transition_position: 0.25,
            program_input: 1,
            preview_input: 2,
        };
        let old = cell.replace(new_state);
        assert_eq!(old, MixEffectState::default());
        assert_eq!(cell.get(), new_state);
    }

    #[test]
    fn test_concurrent_reads_never_see_torn_pairs() {
        let cell = Arc::new(MixEffectCell::default());
        cell.replace(MixEffectState {
            program_input: 1,
            preview_input: 101,
            ..MixEffectState::default()
        });

        let writer_cell = Arc::clone(&cell);
        let writer = std::thread::spawn(move || {
            for n in 1..=5_000i64 {
                writer_cell.update(|s| {
                    s.program_input = n;
                    s.preview_input = n + 100;
                });
            }
        });
        let reader_cell = Arc::clone(&cell);
        let reader = std::thread::spawn(move || {
            for _ in 0..5_000 {
                let state = reader_cell.get();
                assert_eq!(state.preview_input, state.program_input + 100);
            }
        });

        writer.join().expect("writer");
        reader.join().expect("reader");
    }
}
