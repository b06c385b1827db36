//! In-process simulated switcher
//!
//! Implements the device traits without any network. Commands mutate the
//! block state and fire the registered callbacks synchronously, the way a
//! real switcher reports changes back. Used by `--simulate` and by tests,
//! which also use the failure switches and the handle counters.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::device::{
    BlockIter, CallbackId, InputId, InputIter, MixEffectBlock, MixEffectCallback,
    MixEffectEventType, Switcher, SwitcherDiscovery, SwitcherInput, TransitionSelection,
    TransitionStyle, VideoMode,
};
use super::types::{InputInfo, MixEffectState};
use crate::config::SimulatedDeviceConfig;
use crate::error::{ConnectFailure, DeviceError};

/// Discovery over a fixed set of simulated switchers
#[derive(Default)]
pub struct SimulatedDiscovery {
    devices: DashMap<String, Arc<SimulatedSwitcher>>,
    unreachable: DashMap<String, ()>,
    attempts: DashMap<String, usize>,
    total_attempts: AtomicUsize,
}

impl SimulatedDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build devices from the `simulator` section of the config
    pub fn from_config(devices: &[SimulatedDeviceConfig]) -> Self {
        let discovery = Self::new();
        for config in devices {
            discovery.add_device(&config.address, SimulatedSwitcher::from_config(config));
        }
        discovery
    }

    pub fn add_device(&self, address: &str, device: SimulatedSwitcher) -> Arc<SimulatedSwitcher> {
        let device = Arc::new(device);
        self.devices.insert(address.to_string(), Arc::clone(&device));
        debug!(address, "Simulated switcher added");
        device
    }

    pub fn device(&self, address: &str) -> Option<Arc<SimulatedSwitcher>> {
        self.devices.get(address).map(|d| Arc::clone(d.value()))
    }

    pub fn addresses(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.key().clone()).collect()
    }

    /// Make connects to `address` fail (or succeed again)
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if reachable {
            self.unreachable.remove(address);
        } else {
            self.unreachable.insert(address.to_string(), ());
        }
    }

    /// Number of link attempts made so far, all addresses
    pub fn connect_attempts(&self) -> usize {
        self.total_attempts.load(Ordering::SeqCst)
    }

    pub fn connect_attempts_for(&self, address: &str) -> usize {
        self.attempts.get(address).map(|n| *n.value()).unwrap_or(0)
    }
}

impl SwitcherDiscovery for SimulatedDiscovery {
    fn connect_to(&self, address: &str) -> Result<Box<dyn Switcher>, DeviceError> {
        self.total_attempts.fetch_add(1, Ordering::SeqCst);
        *self.attempts.entry(address.to_string()).or_insert(0) += 1;

        let failed = || DeviceError::ConnectFailed {
            address: address.to_string(),
            reason: ConnectFailure::NoResponse,
        };

        if self.unreachable.contains_key(address) {
            return Err(failed());
        }
        let device = self.device(address).ok_or_else(failed)?;
        device.shared.live_links.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedLink { device }))
    }
}

/// Counters and failure switches shared by a switcher and its handles
#[derive(Default)]
struct Shared {
    live_handles: AtomicUsize,
    live_links: AtomicUsize,
    fail_reads: AtomicBool,
    fail_unregister: AtomicBool,
}

/// Next-transition parameters as last set by a client
#[derive(Debug, Clone, PartialEq)]
pub struct NextTransition {
    pub style: TransitionStyle,
    pub selection: TransitionSelection,
    pub rates: HashMap<TransitionStyle, u32>,
}

impl Default for NextTransition {
    fn default() -> Self {
        Self {
            style: TransitionStyle::Mix,
            selection: TransitionSelection::Background,
            rates: HashMap::new(),
        }
    }
}

struct SimBlock {
    state: Mutex<MixEffectState>,
    next_transition: Mutex<NextTransition>,
    callbacks: Mutex<Vec<(CallbackId, MixEffectCallback)>>,
    next_callback_id: AtomicU64,
    shared: Arc<Shared>,
}

/// A simulated switcher
pub struct SimulatedSwitcher {
    video_mode: RwLock<VideoMode>,
    inputs: Vec<InputInfo>,
    blocks: Vec<Arc<SimBlock>>,
    broken_input: Option<usize>,
    broken_block: Option<usize>,
    shared: Arc<Shared>,
}

impl SimulatedSwitcher {
    /// Switcher with `mix_effects` blocks and inputs `1..=input_count`
    ///
    /// Every block starts with input 1 on program and input 2 on preview.
    pub fn new(mix_effects: usize, input_count: usize) -> Self {
        let inputs = (1..=input_count as InputId)
            .map(|id| InputInfo {
                id,
                short_name: format!("CAM{}", id),
                long_name: format!("Camera {}", id),
            })
            .collect();
        Self::with_inputs(mix_effects, inputs)
    }

    pub fn with_inputs(mix_effects: usize, inputs: Vec<InputInfo>) -> Self {
        let shared = Arc::new(Shared::default());
        let initial = MixEffectState {
            in_transition: false,
            transition_position: 0.0,
            program_input: inputs.first().map(|i| i.id).unwrap_or(0),
            preview_input: inputs.get(1).map(|i| i.id).unwrap_or(0),
        };
        let blocks = (0..mix_effects)
            .map(|_| {
                Arc::new(SimBlock {
                    state: Mutex::new(initial),
                    next_transition: Mutex::new(NextTransition::default()),
                    callbacks: Mutex::new(Vec::new()),
                    next_callback_id: AtomicU64::new(1),
                    shared: Arc::clone(&shared),
                })
            })
            .collect();

        Self {
            video_mode: RwLock::new(VideoMode::Hd1080p25),
            inputs,
            blocks,
            broken_input: None,
            broken_block: None,
            shared,
        }
    }

    pub fn from_config(config: &SimulatedDeviceConfig) -> Self {
        let inputs = if config.inputs.is_empty() {
            Self::new(0, config.input_count).inputs
        } else {
            config
                .inputs
                .iter()
                .map(|i| InputInfo {
                    id: i.id,
                    short_name: i.short_name.clone(),
                    long_name: i.long_name.clone(),
                })
                .collect()
        };
        let device = Self::with_inputs(config.mix_effects, inputs);
        let mode = config
            .video_mode
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or(VideoMode::Hd1080p25);
        device.set_video_mode(mode);
        device
    }

    /// Make reading the input at enumeration `position` fail
    pub fn with_broken_input(mut self, position: usize) -> Self {
        self.broken_input = Some(position);
        self
    }

    /// Make the block iterator yield an error at `position`
    pub fn with_broken_block(mut self, position: usize) -> Self {
        self.broken_block = Some(position);
        self
    }

    pub fn set_video_mode(&self, mode: VideoMode) {
        *self.video_mode.write() = mode;
    }

    pub fn mix_effect_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn state(&self, mix_effect: usize) -> Option<MixEffectState> {
        self.blocks.get(mix_effect).map(|b| *b.state.lock())
    }

    pub fn next_transition(&self, mix_effect: usize) -> Option<NextTransition> {
        self.blocks
            .get(mix_effect)
            .map(|b| b.next_transition.lock().clone())
    }

    /// Change block state without notifying anyone
    pub fn mutate(&self, mix_effect: usize, f: impl FnOnce(&mut MixEffectState)) {
        if let Some(block) = self.blocks.get(mix_effect) {
            f(&mut *block.state.lock());
        }
    }

    /// Device-side view of a block, not counted as a client handle
    pub fn device_view(&self, mix_effect: usize) -> Option<SimBlockHandle> {
        self.blocks
            .get(mix_effect)
            .map(|b| SimBlockHandle::uncounted(Arc::clone(b)))
    }

    /// Raise `event` on a block without changing anything
    pub fn emit(&self, mix_effect: usize, event: MixEffectEventType) {
        if let Some(view) = self.device_view(mix_effect) {
            view.fire(&[event]);
        }
    }

    /// Front-panel program change
    pub fn set_program(&self, mix_effect: usize, input: InputId) {
        if let Some(view) = self.device_view(mix_effect) {
            let _ = view.set_program_input(input);
        }
    }

    /// Front-panel preview change
    pub fn set_preview(&self, mix_effect: usize, input: InputId) {
        if let Some(view) = self.device_view(mix_effect) {
            let _ = view.set_preview_input(input);
        }
    }

    /// Registered callbacks across all blocks
    pub fn callback_count(&self) -> usize {
        self.blocks.iter().map(|b| b.callbacks.lock().len()).sum()
    }

    /// Block handles handed to clients and not yet released
    pub fn live_handles(&self) -> usize {
        self.shared.live_handles.load(Ordering::SeqCst)
    }

    /// Links handed to clients and not yet released
    pub fn live_links(&self) -> usize {
        self.shared.live_links.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.shared.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unregister(&self, fail: bool) {
        self.shared.fail_unregister.store(fail, Ordering::SeqCst);
    }
}

/// Link returned by [`SimulatedDiscovery::connect_to`]
struct SimulatedLink {
    device: Arc<SimulatedSwitcher>,
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        self.device.shared.live_links.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Switcher for SimulatedLink {
    fn video_mode(&self) -> Result<VideoMode, DeviceError> {
        Ok(*self.device.video_mode.read())
    }

    fn mix_effect_blocks(&self) -> Result<BlockIter<'_>, DeviceError> {
        let broken = self.device.broken_block;
        let iter = self.device.blocks.iter().enumerate().map(move |(position, block)| {
            if broken == Some(position) {
                return Err(DeviceError::Enumeration {
                    what: "mix effect blocks",
                    message: format!("block {} unavailable", position),
                });
            }
            Ok(Box::new(SimBlockHandle::counted(Arc::clone(block))) as Box<dyn MixEffectBlock>)
        });
        Ok(Box::new(iter))
    }

    fn inputs(&self) -> Result<InputIter<'_>, DeviceError> {
        let broken = self.device.broken_input;
        let iter = self.device.inputs.iter().enumerate().map(move |(position, info)| {
            Ok(Box::new(SimInput {
                info: info.clone(),
                broken: broken == Some(position),
            }) as Box<dyn SwitcherInput>)
        });
        Ok(Box::new(iter))
    }
}

struct SimInput {
    info: InputInfo,
    broken: bool,
}

impl SwitcherInput for SimInput {
    fn input_id(&self) -> Result<InputId, DeviceError> {
        Ok(self.info.id)
    }

    fn short_name(&self) -> Result<String, DeviceError> {
        Ok(self.info.short_name.clone())
    }

    fn long_name(&self) -> Result<String, DeviceError> {
        if self.broken {
            return Err(DeviceError::call("GetLongName", "simulated read failure"));
        }
        Ok(self.info.long_name.clone())
    }
}

/// Handle to a simulated mix-effect block
pub struct SimBlockHandle {
    block: Arc<SimBlock>,
    counted: bool,
}

impl SimBlockHandle {
    fn counted(block: Arc<SimBlock>) -> Self {
        block.shared.live_handles.fetch_add(1, Ordering::SeqCst);
        Self {
            block,
            counted: true,
        }
    }

    fn uncounted(block: Arc<SimBlock>) -> Self {
        Self {
            block,
            counted: false,
        }
    }

    /// Invoke every registered callback for each event, in order
    ///
    /// The callback list is copied first: callbacks re-read this block.
    fn fire(&self, events: &[MixEffectEventType]) {
        let callbacks: Vec<MixEffectCallback> = self
            .block
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for event in events {
            trace!("Simulated switcher raising {:?}", event);
            for callback in &callbacks {
                callback(self, *event);
            }
        }
    }

    fn read<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&MixEffectState) -> T,
    ) -> Result<T, DeviceError> {
        if self.block.shared.fail_reads.load(Ordering::SeqCst) {
            return Err(DeviceError::call(operation, "simulated read failure"));
        }
        Ok(f(&*self.block.state.lock()))
    }
}

impl Drop for SimBlockHandle {
    fn drop(&mut self) {
        if self.counted {
            self.block.shared.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl MixEffectBlock for SimBlockHandle {
    fn in_transition(&self) -> Result<bool, DeviceError> {
        self.read("GetInTransition", |s| s.in_transition)
    }

    fn transition_position(&self) -> Result<f64, DeviceError> {
        self.read("GetTransitionPosition", |s| s.transition_position)
    }

    fn program_input(&self) -> Result<InputId, DeviceError> {
        self.read("GetProgramInput", |s| s.program_input)
    }

    fn preview_input(&self) -> Result<InputId, DeviceError> {
        self.read("GetPreviewInput", |s| s.preview_input)
    }

    fn add_callback(&self, callback: MixEffectCallback) -> Result<CallbackId, DeviceError> {
        let id = self.block.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.block.callbacks.lock().push((id, callback));
        Ok(id)
    }

    fn remove_callback(&self, id: CallbackId) -> Result<(), DeviceError> {
        if self.block.shared.fail_unregister.load(Ordering::SeqCst) {
            return Err(DeviceError::call("RemoveCallback", "simulated unregister failure"));
        }
        let mut callbacks = self.block.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        if callbacks.len() == before {
            return Err(DeviceError::UnknownCallback(id));
        }
        Ok(())
    }

    fn cut(&self) -> Result<(), DeviceError> {
        {
            let mut state = self.block.state.lock();
            let program = state.program_input;
            state.program_input = state.preview_input;
            state.preview_input = program;
        }
        self.fire(&[
            MixEffectEventType::ProgramInputChanged,
            MixEffectEventType::PreviewInputChanged,
        ]);
        Ok(())
    }

    fn perform_auto_transition(&self) -> Result<(), DeviceError> {
        {
            let mut state = self.block.state.lock();
            state.in_transition = true;
            state.transition_position = 0.0;
        }
        self.fire(&[MixEffectEventType::InTransitionChanged]);

        self.block.state.lock().transition_position = 0.5;
        self.fire(&[
            MixEffectEventType::TransitionPositionChanged,
            MixEffectEventType::TransitionFramesRemainingChanged,
        ]);

        {
            let mut state = self.block.state.lock();
            let program = state.program_input;
            state.program_input = state.preview_input;
            state.preview_input = program;
            state.transition_position = 0.0;
            state.in_transition = false;
        }
        self.fire(&[
            MixEffectEventType::ProgramInputChanged,
            MixEffectEventType::PreviewInputChanged,
            MixEffectEventType::TransitionPositionChanged,
            MixEffectEventType::InTransitionChanged,
        ]);
        Ok(())
    }

    fn set_program_input(&self, input: InputId) -> Result<(), DeviceError> {
        self.block.state.lock().program_input = input;
        self.fire(&[MixEffectEventType::ProgramInputChanged]);
        Ok(())
    }

    fn set_preview_input(&self, input: InputId) -> Result<(), DeviceError> {
        self.block.state.lock().preview_input = input;
        self.fire(&[MixEffectEventType::PreviewInputChanged]);
        Ok(())
    }

    fn set_next_transition_style(&self, style: TransitionStyle) -> Result<(), DeviceError> {
        self.block.next_transition.lock().style = style;
        Ok(())
    }

    fn set_next_transition_selection(
        &self,
        selection: TransitionSelection,
    ) -> Result<(), DeviceError> {
        self.block.next_transition.lock().selection = selection;
        Ok(())
    }

    fn set_transition_rate(&self, style: TransitionStyle, frames: u32) -> Result<(), DeviceError> {
        if !style.has_rate() {
            return Err(DeviceError::call("SetRate", format!("{} has no rate", style)));
        }
        self.block.next_transition.lock().rates.insert(style, frames);
        Ok(())
    }
}
