//! Switcher commands
//!
//! Fire-and-forget operations on one mix-effect block of a live link.
//! Each call enumerates to the block, acts, and drops the handle.

use tracing::debug;

use super::device::{InputId, MixEffectBlock, Switcher, TransitionSelection, TransitionStyle};
use crate::error::DeviceError;

pub const MIN_TRANSITION_FRAMES: u32 = 1;
pub const MAX_TRANSITION_FRAMES: u32 = 250;

/// Convert a transition duration to the frame count sent as the rate
///
/// `round(seconds * fps) / 2` in integer arithmetic, clamped to
/// `1..=250`. Negative and NaN durations clamp to the minimum.
pub fn duration_to_frames(seconds: f64, fps: f64) -> u32 {
    // Half of the rounded frame count; existing button settings are tuned to it
    let frames = (seconds * fps).round() as u32 / 2;
    frames.clamp(MIN_TRANSITION_FRAMES, MAX_TRANSITION_FRAMES)
}

/// Handle to the block at device position `index`
pub fn mix_effect_block(
    link: &dyn Switcher,
    index: usize,
) -> Result<Box<dyn MixEffectBlock>, DeviceError> {
    link.mix_effect_blocks()?
        .nth(index)
        .transpose()?
        .ok_or(DeviceError::MixEffectNotFound { index })
}

pub fn cut(link: &dyn Switcher, mix_effect: usize) -> Result<(), DeviceError> {
    mix_effect_block(link, mix_effect)?.cut()?;
    debug!(mix_effect, "Cut executed");
    Ok(())
}

pub fn auto_transition(link: &dyn Switcher, mix_effect: usize) -> Result<(), DeviceError> {
    mix_effect_block(link, mix_effect)?.perform_auto_transition()?;
    debug!(mix_effect, "Auto transition executed");
    Ok(())
}

pub fn set_preview_input(
    link: &dyn Switcher,
    mix_effect: usize,
    input: InputId,
) -> Result<(), DeviceError> {
    mix_effect_block(link, mix_effect)?.set_preview_input(input)?;
    debug!(mix_effect, "Preview set to input {}", input);
    Ok(())
}

pub fn set_program_input(
    link: &dyn Switcher,
    mix_effect: usize,
    input: InputId,
) -> Result<(), DeviceError> {
    mix_effect_block(link, mix_effect)?.set_program_input(input)?;
    debug!(mix_effect, "Program set to input {}", input);
    Ok(())
}

/// Select the next transition style and its rate
///
/// Also selects the background layer. Stinger has no rate, so `frames` is
/// ignored for it.
pub fn set_next_transition(
    link: &dyn Switcher,
    mix_effect: usize,
    style: TransitionStyle,
    frames: u32,
) -> Result<(), DeviceError> {
    let block = mix_effect_block(link, mix_effect)?;
    block.set_next_transition_style(style)?;
    block.set_next_transition_selection(TransitionSelection::Background)?;
    if style.has_rate() {
        block.set_transition_rate(style, frames)?;
    }
    debug!(mix_effect, "Next transition set to {} ({} frames)", style, frames);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switcher::device::SwitcherDiscovery;
    use crate::switcher::simulator::{SimulatedDiscovery, SimulatedSwitcher};
    use proptest::prelude::*;

    #[test]
    fn test_duration_conversion() {
        assert_eq!(duration_to_frames(1.0, 30.0), 15);
        assert_eq!(duration_to_frames(20.0, 30.0), 250);
        assert_eq!(duration_to_frames(1.0, 25.0), 12);
        assert_eq!(duration_to_frames(0.01, 25.0), 1);
        assert_eq!(duration_to_frames(-3.0, 25.0), 1);
        assert_eq!(duration_to_frames(f64::NAN, 25.0), 1);
    }

    proptest! {
        #[test]
        fn prop_frames_always_in_range(seconds in -100.0f64..1000.0, fps in 1.0f64..120.0) {
            let frames = duration_to_frames(seconds, fps);
            prop_assert!((MIN_TRANSITION_FRAMES..=MAX_TRANSITION_FRAMES).contains(&frames));
        }

        #[test]
        fn prop_longer_never_means_fewer_frames(seconds in 0.0f64..30.0, extra in 0.0f64..5.0, fps in 1.0f64..120.0) {
            prop_assert!(duration_to_frames(seconds + extra, fps) >= duration_to_frames(seconds, fps));
        }
    }

    fn link_to(device: SimulatedSwitcher) -> (Box<dyn Switcher>, std::sync::Arc<SimulatedSwitcher>) {
        let discovery = SimulatedDiscovery::new();
        let device = discovery.add_device("sim", device);
        let link = discovery.connect_to("sim").expect("connect");
        (link, device)
    }

    #[test]
    fn test_commands_reach_requested_block() {
        let (link, device) = link_to(SimulatedSwitcher::new(2, 6));

        set_preview_input(link.as_ref(), 1, 5).expect("preview");
        set_program_input(link.as_ref(), 1, 6).expect("program");
        cut(link.as_ref(), 1).expect("cut");

        let state = device.state(1).expect("block 1");
        assert_eq!((state.program_input, state.preview_input), (5, 6));
        assert_eq!(device.state(0).map(|s| s.program_input), Some(1));
        assert_eq!(device.live_handles(), 0);
    }

    #[test]
    fn test_missing_block_is_reported() {
        let (link, _device) = link_to(SimulatedSwitcher::new(1, 2));
        assert!(matches!(
            cut(link.as_ref(), 3),
            Err(DeviceError::MixEffectNotFound { index: 3 })
        ));
    }

    #[test]
    fn test_next_transition_sets_style_selection_and_rate() {
        let (link, device) = link_to(SimulatedSwitcher::new(1, 2));

        set_next_transition(link.as_ref(), 0, TransitionStyle::Wipe, 15).expect("wipe");

        let next = device.next_transition(0).expect("block 0");
        assert_eq!(next.style, TransitionStyle::Wipe);
        assert_eq!(next.selection, TransitionSelection::Background);
        assert_eq!(next.rates.get(&TransitionStyle::Wipe), Some(&15));
    }

    #[test]
    fn test_stinger_has_no_rate() {
        let (link, device) = link_to(SimulatedSwitcher::new(1, 2));

        set_next_transition(link.as_ref(), 0, TransitionStyle::Stinger, 40).expect("stinger");

        let next = device.next_transition(0).expect("block 0");
        assert_eq!(next.style, TransitionStyle::Stinger);
        assert!(next.rates.is_empty());
    }
}
