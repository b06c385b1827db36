//! Switcher connections and cached state
//!
//! Consumers go through [`ConnectionRegistry`]: look up a [`Connection`] by
//! address, read the cached [`SwitcherState`] and [`CapabilitySnapshot`],
//! subscribe to [`StateChangeEvent`]s and send commands over the live link.

mod callback;
pub mod commands;
mod connection;
mod device;
mod events;
mod info;
mod registry;
pub mod simulator;
mod store;
mod types;

pub use callback::{initialize_state, translate};
pub use connection::{Connection, ConnectionState, RetryPolicy};
pub use device::{
    BlockIter, CallbackId, InputId, InputIter, MixEffectBlock, MixEffectCallback,
    MixEffectEventType, Switcher, SwitcherDiscovery, SwitcherInput, TransitionSelection,
    TransitionStyle, VideoMode, DEFAULT_FRAME_RATE,
};
pub use events::{EventBus, SubscriptionId};
pub use info::{CapabilityReport, InputEntry, TransitionStyleEntry};
pub use registry::{ConnectionRegistry, RegistrySettings};
pub use store::StateStore;
pub use types::{
    CapabilitySnapshot, EventKind, InputInfo, MixEffectCell, MixEffectState, StateChangeEvent,
    StateValue, SwitcherState,
};
