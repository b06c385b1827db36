//! Configuration management for ATEM GW
//!
//! Handles loading, parsing, and hot-reloading of YAML configuration files.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::fs;

use crate::switcher::{InputId, RegistrySettings, TransitionStyle, VideoMode};

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Devices created in `--simulate` mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub simulator: Vec<SimulatedDeviceConfig>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

/// Connection registry timing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistryConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            idle_timeout_secs: default_idle_timeout(),
            max_retries: default_max_retries(),
            reconnect_backoff_ms: default_reconnect_backoff(),
        }
    }
}

impl RegistryConfig {
    pub fn settings(&self) -> RegistrySettings {
        RegistrySettings {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_retries: self.max_retries,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }
}

/// A simulated switcher
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimulatedDeviceConfig {
    pub address: String,
    #[serde(default = "default_mix_effects")]
    pub mix_effects: usize,
    /// Number of generated inputs when `inputs` is empty
    #[serde(default = "default_input_count")]
    pub input_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<SimulatedInputConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimulatedInputConfig {
    pub id: InputId,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub long_name: String,
}

/// A button bound to one mix-effect block of one switcher
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ActionConfig {
    pub name: String,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub mix_effect: usize,
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// What a button does when pressed, and what it shows
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    Cut,
    Auto {
        #[serde(default)]
        show_tally: bool,
    },
    Preview {
        #[serde(default = "default_input")]
        input: InputId,
        #[serde(default = "default_true")]
        tally_preview: bool,
        #[serde(default)]
        tally_program: bool,
    },
    Program {
        #[serde(default = "default_input")]
        input: InputId,
        #[serde(default)]
        tally_preview: bool,
        #[serde(default = "default_true")]
        tally_program: bool,
    },
    NextTransition {
        /// Index into Mix, Dip, Wipe, DVE, Stinger
        #[serde(default)]
        style: usize,
        /// Seconds
        #[serde(default = "default_duration")]
        duration: f64,
        #[serde(default)]
        show_tally: bool,
    },
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        // Validate the loaded configuration
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.registry.sweep_interval_secs == 0 {
            anyhow::bail!("registry.sweep_interval_secs must be greater than 0");
        }

        for (idx, device) in self.simulator.iter().enumerate() {
            if device.address.is_empty() {
                anyhow::bail!("Simulated device {} address cannot be empty", idx);
            }
            if device.mix_effects == 0 {
                anyhow::bail!(
                    "Simulated device '{}' needs at least one mix effect block",
                    device.address
                );
            }
            if let Some(mode) = &device.video_mode {
                mode.parse::<VideoMode>()
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("Invalid video_mode for '{}'", device.address))?;
            }
        }

        let mut names = HashSet::new();
        for (idx, action) in self.actions.iter().enumerate() {
            if action.name.is_empty() {
                anyhow::bail!("Action {} name cannot be empty", idx);
            }
            if !names.insert(action.name.as_str()) {
                anyhow::bail!("Duplicate action name '{}'", action.name);
            }
            self.validate_action(action)
                .with_context(|| format!("Invalid action '{}'", action.name))?;
        }

        Ok(())
    }

    /// Validate a single action
    fn validate_action(&self, action: &ActionConfig) -> Result<()> {
        if action.address.is_empty() {
            anyhow::bail!("address cannot be empty");
        }

        if let ActionKind::NextTransition {
            style, duration, ..
        } = &action.kind
        {
            if *style >= TransitionStyle::ALL.len() {
                anyhow::bail!(
                    "transition style {} is invalid (must be 0-{})",
                    style,
                    TransitionStyle::ALL.len() - 1
                );
            }
            if !(duration.is_finite() && *duration > 0.0) {
                anyhow::bail!("duration {} must be a positive number of seconds", duration);
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_sweep_interval() -> u64 { 5 }
fn default_idle_timeout() -> u64 { 300 }
fn default_max_retries() -> u32 { 3 }
fn default_reconnect_backoff() -> u64 { 2000 }
fn default_mix_effects() -> usize { 1 }
fn default_input_count() -> usize { 8 }
fn default_address() -> String { "192.168.1.101".to_string() }
fn default_input() -> InputId { 1 }
fn default_duration() -> f64 { 1.0 }
fn default_true() -> bool { true }
