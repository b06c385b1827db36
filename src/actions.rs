//! Button actions
//!
//! Headless buttons bound to one mix-effect block of one switcher. A press
//! sends a command over the live link; the indicator follows the cached
//! state through the registry's change events and the connection's
//! connected/disconnected notifications.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::config::{ActionConfig, ActionKind};
use crate::switcher::commands::{self, duration_to_frames};
use crate::switcher::{
    Connection, ConnectionRegistry, EventKind, MixEffectState, StateChangeEvent, SubscriptionId,
    TransitionStyle,
};
use crate::tally::{input_tally, transition_tally, Indicator, TallyOptions};

/// Receives `(action name, indicator)` whenever an action's indicator changes
pub type IndicatorSink = Arc<dyn Fn(&str, Indicator) + Send + Sync>;

impl ActionKind {
    /// Change kinds that can alter this action's indicator
    fn watched_events(&self) -> &'static [EventKind] {
        match self {
            ActionKind::Cut => &[],
            ActionKind::Auto { show_tally } | ActionKind::NextTransition { show_tally, .. } => {
                if *show_tally {
                    &[EventKind::TransitionStateChanged]
                } else {
                    &[]
                }
            },
            ActionKind::Preview {
                tally_preview,
                tally_program,
                ..
            }
            | ActionKind::Program {
                tally_preview,
                tally_program,
                ..
            } => {
                if *tally_preview || *tally_program {
                    &[EventKind::PreviewInputChanged, EventKind::ProgramInputChanged]
                } else {
                    &[]
                }
            },
        }
    }

    fn indicator(&self, state: &MixEffectState) -> Indicator {
        match self {
            ActionKind::Cut => Indicator::Off,
            ActionKind::Auto { show_tally } | ActionKind::NextTransition { show_tally, .. } => {
                transition_tally(state, *show_tally)
            },
            ActionKind::Preview {
                input,
                tally_preview,
                tally_program,
            }
            | ActionKind::Program {
                input,
                tally_preview,
                tally_program,
            } => input_tally(
                state,
                *input,
                TallyOptions {
                    preview: *tally_preview,
                    program: *tally_program,
                },
            ),
        }
    }
}

/// Subscriptions held while attached
#[derive(Default)]
struct Binding {
    address: String,
    connection: Option<Arc<Connection>>,
    state_events: Option<SubscriptionId>,
    connection_events: Option<SubscriptionId>,
}

struct ActionInner {
    name: String,
    mix_effect: usize,
    kind: ActionKind,
    registry: Arc<ConnectionRegistry>,
    sink: IndicatorSink,
    binding: Mutex<Binding>,
    last_indicator: Mutex<Option<Indicator>>,
}

/// One configured button
#[derive(Clone)]
pub struct Action {
    inner: Arc<ActionInner>,
}

impl Action {
    pub fn new(config: &ActionConfig, registry: Arc<ConnectionRegistry>, sink: IndicatorSink) -> Self {
        Self {
            inner: Arc::new(ActionInner {
                name: config.name.clone(),
                mix_effect: config.mix_effect,
                kind: config.kind.clone(),
                registry,
                sink,
                binding: Mutex::new(Binding {
                    address: config.address.clone(),
                    ..Binding::default()
                }),
                last_indicator: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> &ActionKind {
        &self.inner.kind
    }

    pub fn address(&self) -> String {
        self.inner.binding.lock().address.clone()
    }

    /// Last indicator pushed to the sink
    pub fn indicator(&self) -> Option<Indicator> {
        *self.inner.last_indicator.lock()
    }

    /// Acquire the connection and start following its state
    pub fn attach(&self) {
        let mut binding = self.inner.binding.lock();
        if binding.connection.is_some() {
            return;
        }

        let connection = self.inner.registry.get_or_create(&binding.address);

        let watched = self.inner.kind.watched_events();
        if !watched.is_empty() {
            let weak = Arc::downgrade(&self.inner);
            let address = binding.address.clone();
            let mix_effect = self.inner.mix_effect;
            binding.state_events = Some(self.inner.registry.subscribe(move |event: &StateChangeEvent| {
                if event.concerns(&address, mix_effect) && watched.contains(&event.kind) {
                    refresh_weak(&weak);
                }
            }));
        }

        let weak = Arc::downgrade(&self.inner);
        binding.connection_events = Some(connection.subscribe_state(move |_| refresh_weak(&weak)));
        binding.connection = Some(connection);
        debug!(action = %self.inner.name, address = %binding.address, "Action attached");
        drop(binding);

        self.inner.refresh();
    }

    /// Drop both subscriptions. The connection itself stays in the registry.
    pub fn detach(&self) {
        let mut binding = self.inner.binding.lock();
        if let Some(id) = binding.state_events.take() {
            self.inner.registry.unsubscribe(id);
        }
        if let Some(connection) = binding.connection.take() {
            if let Some(id) = binding.connection_events.take() {
                connection.unsubscribe_state(id);
            }
        }
        debug!(action = %self.inner.name, "Action detached");
    }

    /// Point the action at another switcher
    pub fn set_address(&self, address: &str) {
        if self.inner.binding.lock().address == address {
            return;
        }
        info!(action = %self.inner.name, "Switcher address changed to {}", address);
        self.detach();
        self.inner.binding.lock().address = address.to_string();
        self.attach();
    }

    /// Apply a reloaded entry with the same name
    ///
    /// Only an address change can be applied in place. Returns false when
    /// the kind or mix-effect block changed and the action must be rebuilt.
    pub fn reconfigure(&self, config: &ActionConfig) -> bool {
        if config.kind != self.inner.kind || config.mix_effect != self.inner.mix_effect {
            return false;
        }
        self.set_address(&config.address);
        true
    }

    /// Recompute the indicator from cached state
    pub fn refresh(&self) {
        self.inner.refresh();
    }

    /// Send this action's command. Returns whether it was sent.
    pub fn press(&self) -> bool {
        self.inner.press()
    }
}

/// Turn `configs` into attached actions, reusing `current` where possible
///
/// Actions whose name is gone, or whose kind or block changed, are detached.
/// Actions that only moved to another switcher are kept and re-acquire the
/// connection for the new address.
pub fn reload_actions(
    mut current: Vec<Action>,
    configs: &[ActionConfig],
    registry: &Arc<ConnectionRegistry>,
    sink: &IndicatorSink,
) -> Vec<Action> {
    let attach_new = |config: &ActionConfig| {
        let action = Action::new(config, Arc::clone(registry), Arc::clone(sink));
        action.attach();
        action
    };

    let actions: Vec<Action> = configs
        .iter()
        .map(|config| match current.iter().position(|a| a.name() == config.name) {
            Some(idx) => {
                let existing = current.swap_remove(idx);
                if existing.reconfigure(config) {
                    existing
                } else {
                    existing.detach();
                    attach_new(config)
                }
            },
            None => attach_new(config),
        })
        .collect();

    for removed in current {
        debug!(action = %removed.name(), "Action removed from config");
        removed.detach();
    }
    actions
}

fn refresh_weak(inner: &Weak<ActionInner>) {
    if let Some(inner) = inner.upgrade() {
        inner.refresh();
    }
}

impl ActionInner {
    fn current_binding(&self) -> (String, Option<Arc<Connection>>) {
        let binding = self.binding.lock();
        (binding.address.clone(), binding.connection.clone())
    }

    fn refresh(&self) {
        let (address, connection) = self.current_binding();
        let connected = connection.map(|c| c.is_connected()).unwrap_or(false);

        let indicator = if !connected || !self.registry.capabilities(&address).is_populated() {
            Indicator::Off
        } else {
            let state = self
                .registry
                .switcher_state(&address)
                .mix_effect_state(self.mix_effect);
            self.kind.indicator(&state)
        };

        let changed = {
            let mut last = self.last_indicator.lock();
            let changed = *last != Some(indicator);
            *last = Some(indicator);
            changed
        };
        if changed {
            (self.sink)(&self.name, indicator);
        }
    }

    fn press(&self) -> bool {
        let (address, connection) = self.current_binding();
        let Some(link) = connection.and_then(|c| c.live_link()) else {
            warn!(action = %self.name, address = %address, "Switcher not connected, ignoring press");
            return false;
        };
        let link = link.as_ref();
        let me = self.mix_effect;

        let result = match &self.kind {
            ActionKind::Cut => commands::cut(link, me),
            ActionKind::Auto { .. } => commands::auto_transition(link, me),
            ActionKind::Preview { input, .. } => commands::set_preview_input(link, me, *input),
            ActionKind::Program { input, .. } => commands::set_program_input(link, me, *input),
            ActionKind::NextTransition {
                style, duration, ..
            } => {
                let fps = self.registry.frame_rate(&address);
                let frames = duration_to_frames(*duration, fps);
                commands::set_next_transition(link, me, TransitionStyle::from_index(*style), frames)
            },
        };

        match result {
            Ok(()) => {
                info!(action = %self.name, address = %address, mix_effect = me, "Action executed");
                true
            },
            Err(e) => {
                error!(action = %self.name, address = %address, mix_effect = me, "Action failed: {}", e);
                false
            },
        }
    }
}
