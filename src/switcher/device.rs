//! Opaque device interface
//!
//! The vendor control protocol is not implemented here. A backend exposes a
//! discovery entry point, a connected switcher with iterator-based
//! enumeration of mix-effect blocks and inputs, and per-block command and
//! callback methods. Every enumerated handle is an owned box: dropping it
//! releases the underlying device object.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::DeviceError;

/// Input identifier as reported by the switcher (0 is a valid "none" value)
pub type InputId = i64;

/// Handle returned by [`MixEffectBlock::add_callback`]
pub type CallbackId = u64;

/// Frame rate used when the video mode is unknown
pub const DEFAULT_FRAME_RATE: f64 = 25.0;

/// Iterator over mix-effect blocks; dropping it releases the iterator
pub type BlockIter<'a> =
    Box<dyn Iterator<Item = Result<Box<dyn MixEffectBlock>, DeviceError>> + Send + 'a>;

/// Iterator over switcher inputs; dropping it releases the iterator
pub type InputIter<'a> =
    Box<dyn Iterator<Item = Result<Box<dyn SwitcherInput>, DeviceError>> + Send + 'a>;

/// Callback invoked by the device when a mix-effect block changes
///
/// The device passes the block that raised the event so the receiver can
/// re-read the current values. The event kind is the only payload.
pub type MixEffectCallback = Arc<dyn Fn(&dyn MixEffectBlock, MixEffectEventType) + Send + Sync>;

/// Entry point used to open a link to a switcher
pub trait SwitcherDiscovery: Send + Sync {
    /// Open a link to the switcher at `address` (blocking, I/O bound)
    fn connect_to(&self, address: &str) -> Result<Box<dyn Switcher>, DeviceError>;
}

/// A connected switcher
pub trait Switcher: Send + Sync {
    fn video_mode(&self) -> Result<VideoMode, DeviceError>;

    /// Enumerate mix-effect blocks in device order
    fn mix_effect_blocks(&self) -> Result<BlockIter<'_>, DeviceError>;

    /// Enumerate external and internal inputs
    fn inputs(&self) -> Result<InputIter<'_>, DeviceError>;
}

/// A switcher input (camera, media player, color generator...)
pub trait SwitcherInput: Send {
    fn input_id(&self) -> Result<InputId, DeviceError>;
    fn short_name(&self) -> Result<String, DeviceError>;
    fn long_name(&self) -> Result<String, DeviceError>;
}

/// One mix-effect block of a connected switcher
pub trait MixEffectBlock: Send + Sync {
    fn in_transition(&self) -> Result<bool, DeviceError>;
    fn transition_position(&self) -> Result<f64, DeviceError>;
    fn program_input(&self) -> Result<InputId, DeviceError>;
    fn preview_input(&self) -> Result<InputId, DeviceError>;

    fn add_callback(&self, callback: MixEffectCallback) -> Result<CallbackId, DeviceError>;
    fn remove_callback(&self, id: CallbackId) -> Result<(), DeviceError>;

    fn cut(&self) -> Result<(), DeviceError>;
    fn perform_auto_transition(&self) -> Result<(), DeviceError>;
    fn set_program_input(&self, input: InputId) -> Result<(), DeviceError>;
    fn set_preview_input(&self, input: InputId) -> Result<(), DeviceError>;

    fn set_next_transition_style(&self, style: TransitionStyle) -> Result<(), DeviceError>;
    fn set_next_transition_selection(
        &self,
        selection: TransitionSelection,
    ) -> Result<(), DeviceError>;

    /// Set the rate (in frames) of the parameters for `style`
    fn set_transition_rate(&self, style: TransitionStyle, frames: u32)
        -> Result<(), DeviceError>;
}

/// Event kinds raised by a mix-effect block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixEffectEventType {
    ProgramInputChanged,
    PreviewInputChanged,
    InTransitionChanged,
    TransitionPositionChanged,
    TransitionFramesRemainingChanged,
    FadeToBlackFramesRemainingChanged,
    PreviewLiveChanged,
    /// Any kind this crate does not know about
    Other(u32),
}

/// Next-transition style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionStyle {
    Mix,
    Dip,
    Wipe,
    Dve,
    Stinger,
}

impl TransitionStyle {
    pub const ALL: [TransitionStyle; 5] = [
        TransitionStyle::Mix,
        TransitionStyle::Dip,
        TransitionStyle::Wipe,
        TransitionStyle::Dve,
        TransitionStyle::Stinger,
    ];

    /// Map a settings index to a style. Unknown indices fall back to Mix.
    pub fn from_index(index: usize) -> Self {
        Self::ALL.get(index).copied().unwrap_or(TransitionStyle::Mix)
    }

    pub fn index(self) -> usize {
        match self {
            TransitionStyle::Mix => 0,
            TransitionStyle::Dip => 1,
            TransitionStyle::Wipe => 2,
            TransitionStyle::Dve => 3,
            TransitionStyle::Stinger => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransitionStyle::Mix => "Mix",
            TransitionStyle::Dip => "Dip",
            TransitionStyle::Wipe => "Wipe",
            TransitionStyle::Dve => "DVE",
            TransitionStyle::Stinger => "Stinger",
        }
    }

    /// Whether the style's parameters carry a configurable rate
    ///
    /// Stinger duration comes from the clip, not from a rate.
    pub fn has_rate(self) -> bool {
        !matches!(self, TransitionStyle::Stinger)
    }
}

impl fmt::Display for TransitionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Layers included in the next transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionSelection {
    Background,
    Key(u8),
}

/// Video standard reported by the switcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMode {
    Ntsc525i5994,
    Pal625i50,
    Hd720p50,
    Hd720p5994,
    Hd1080i50,
    Hd1080i5994,
    Hd1080p2398,
    Hd1080p24,
    Hd1080p25,
    Hd1080p2997,
    Hd1080p30,
    Hd1080p50,
    Hd1080p5994,
    Hd1080p60,
    /// A mode without a known frame rate (4K/8K variants, future modes)
    Other(u32),
}

impl VideoMode {
    /// Frames per second used for duration conversion
    ///
    /// Interlaced modes count frames, not fields. The NTSC SD mode reports 25
    /// like the PAL one; that is what the transition rate math was tuned on.
    pub fn frame_rate(self) -> Option<f64> {
        let fps = match self {
            VideoMode::Ntsc525i5994 | VideoMode::Pal625i50 => 25.0,
            VideoMode::Hd720p50 => 50.0,
            VideoMode::Hd720p5994 => 59.94,
            VideoMode::Hd1080i50 => 25.0,
            VideoMode::Hd1080i5994 => 29.97,
            VideoMode::Hd1080p2398 => 23.98,
            VideoMode::Hd1080p24 => 24.0,
            VideoMode::Hd1080p25 => 25.0,
            VideoMode::Hd1080p2997 => 29.97,
            VideoMode::Hd1080p30 => 30.0,
            VideoMode::Hd1080p50 => 50.0,
            VideoMode::Hd1080p5994 => 59.94,
            VideoMode::Hd1080p60 => 60.0,
            VideoMode::Other(_) => return None,
        };
        Some(fps)
    }

    /// Frame rate with the default applied
    pub fn frame_rate_or_default(self) -> f64 {
        self.frame_rate().unwrap_or(DEFAULT_FRAME_RATE)
    }
}

impl FromStr for VideoMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.trim().to_ascii_lowercase().as_str() {
            "525i59.94" | "ntsc" => VideoMode::Ntsc525i5994,
            "625i50" | "pal" => VideoMode::Pal625i50,
            "720p50" => VideoMode::Hd720p50,
            "720p59.94" => VideoMode::Hd720p5994,
            "1080i50" => VideoMode::Hd1080i50,
            "1080i59.94" => VideoMode::Hd1080i5994,
            "1080p23.98" => VideoMode::Hd1080p2398,
            "1080p24" => VideoMode::Hd1080p24,
            "1080p25" => VideoMode::Hd1080p25,
            "1080p29.97" => VideoMode::Hd1080p2997,
            "1080p30" => VideoMode::Hd1080p30,
            "1080p50" => VideoMode::Hd1080p50,
            "1080p59.94" => VideoMode::Hd1080p5994,
            "1080p60" => VideoMode::Hd1080p60,
            other => return Err(format!("Unknown video mode '{}'", other)),
        };
        Ok(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_style_index_fallback() {
        assert_eq!(TransitionStyle::from_index(0), TransitionStyle::Mix);
        assert_eq!(TransitionStyle::from_index(3), TransitionStyle::Dve);
        assert_eq!(TransitionStyle::from_index(4), TransitionStyle::Stinger);
        assert_eq!(TransitionStyle::from_index(9), TransitionStyle::Mix);

        for style in TransitionStyle::ALL {
            assert_eq!(TransitionStyle::from_index(style.index()), style);
        }
    }

    #[test]
    fn test_video_mode_frame_rates() {
        assert_eq!(VideoMode::Hd1080p30.frame_rate(), Some(30.0));
        assert_eq!(VideoMode::Hd1080i50.frame_rate(), Some(25.0));
        assert_eq!(VideoMode::Hd720p5994.frame_rate(), Some(59.94));
        assert_eq!(VideoMode::Other(42).frame_rate(), None);
        assert_eq!(VideoMode::Other(42).frame_rate_or_default(), DEFAULT_FRAME_RATE);
    }

    #[test]
    fn test_video_mode_parse() {
        assert_eq!("1080p29.97".parse::<VideoMode>(), Ok(VideoMode::Hd1080p2997));
        assert_eq!("PAL".parse::<VideoMode>(), Ok(VideoMode::Pal625i50));
        assert!("2160p60".parse::<VideoMode>().is_err());
    }
}
