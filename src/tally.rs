//! Tally rules
//!
//! Decide what a button shows from the cached mix-effect state. Program
//! always wins over preview when both apply.

use colored::{ColoredString, Colorize};
use std::fmt;

use crate::switcher::{InputId, MixEffectState};

/// What a button shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Off,
    /// Input is on preview (green)
    Preview,
    /// Input is on program (red)
    Program,
    /// A transition is running (red)
    Transition,
}

impl Indicator {
    pub fn as_str(self) -> &'static str {
        match self {
            Indicator::Off => "off",
            Indicator::Preview => "preview",
            Indicator::Program => "program",
            Indicator::Transition => "transition",
        }
    }

    /// Terminal rendering used by the REPL and the log sink
    pub fn colored(self) -> ColoredString {
        match self {
            Indicator::Off => self.as_str().dimmed(),
            Indicator::Preview => self.as_str().green().bold(),
            Indicator::Program | Indicator::Transition => self.as_str().red().bold(),
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which conditions light an input button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TallyOptions {
    pub preview: bool,
    pub program: bool,
}

/// Indicator for a button bound to `input`
pub fn input_tally(state: &MixEffectState, input: InputId, options: TallyOptions) -> Indicator {
    if options.program && state.program_input == input {
        Indicator::Program
    } else if options.preview && state.preview_input == input {
        Indicator::Preview
    } else {
        Indicator::Off
    }
}

/// Indicator for a transition button
pub fn transition_tally(state: &MixEffectState, show: bool) -> Indicator {
    if show && state.in_transition {
        Indicator::Transition
    } else {
        Indicator::Off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(program: InputId, preview: InputId) -> MixEffectState {
        MixEffectState {
            program_input: program,
            preview_input: preview,
            ..MixEffectState::default()
        }
    }

    const BOTH: TallyOptions = TallyOptions {
        preview: true,
        program: true,
    };

    #[test]
    fn test_program_beats_preview() {
        // Same input on both buses
        assert_eq!(input_tally(&state(3, 3), 3, BOTH), Indicator::Program);
        assert_eq!(input_tally(&state(3, 4), 4, BOTH), Indicator::Preview);
        assert_eq!(input_tally(&state(3, 4), 5, BOTH), Indicator::Off);
    }

    #[test]
    fn test_disabled_conditions_are_ignored() {
        let preview_only = TallyOptions {
            preview: true,
            program: false,
        };
        assert_eq!(input_tally(&state(3, 3), 3, preview_only), Indicator::Preview);
        assert_eq!(input_tally(&state(3, 4), 3, preview_only), Indicator::Off);
        assert_eq!(input_tally(&state(3, 4), 3, TallyOptions::default()), Indicator::Off);
    }

    #[test]
    fn test_transition_tally() {
        let mut running = MixEffectState::default();
        running.in_transition = true;

        assert_eq!(transition_tally(&running, true), Indicator::Transition);
        assert_eq!(transition_tally(&running, false), Indicator::Off);
        assert_eq!(transition_tally(&MixEffectState::default(), true), Indicator::Off);
    }
}
