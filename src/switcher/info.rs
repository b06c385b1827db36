//! Capability query response
//!
//! JSON shape handed to configuration front-ends so they can offer input
//! and transition-style pickers.

use serde::Serialize;

use super::device::{InputId, TransitionStyle};
use super::types::CapabilitySnapshot;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEntry {
    pub input_id: InputId,
    pub short_name: String,
    pub long_name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionStyleEntry {
    pub index: usize,
    pub name: &'static str,
}

/// Everything known about one switcher
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityReport {
    pub ip_address: String,
    pub mix_effect_count: usize,
    pub input_count: usize,
    pub inputs: Vec<InputEntry>,
    pub transition_styles: Vec<TransitionStyleEntry>,
}

impl CapabilityReport {
    /// Build the report, or `None` while the snapshot is still a placeholder
    pub fn from_snapshot(snapshot: &CapabilitySnapshot) -> Option<Self> {
        if !snapshot.is_populated() {
            return None;
        }

        let inputs = snapshot
            .inputs
            .iter()
            .map(|input| InputEntry {
                input_id: input.id,
                short_name: input.short_name.clone(),
                long_name: input.long_name.clone(),
                display_name: input.display_name(),
            })
            .collect();

        let transition_styles = TransitionStyle::ALL
            .iter()
            .map(|style| TransitionStyleEntry {
                index: style.index(),
                name: style.name(),
            })
            .collect();

        Some(Self {
            ip_address: snapshot.address.clone(),
            mix_effect_count: snapshot.mix_effect_count,
            input_count: snapshot.input_count,
            inputs,
            transition_styles,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
