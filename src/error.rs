//! Error types for switcher access
//!
//! Device calls return [`DeviceError`]. The connection and cache layers never
//! hand these to consumers: they are logged and folded into observable state
//! (connected flag, cache freshness). Only the command helpers return them,
//! and the action layer logs and drops them.

use thiserror::Error;

use crate::switcher::CallbackId;

/// Reason reported by the device when a connect attempt is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectFailure {
    #[error("no response")]
    NoResponse,
    #[error("incompatible firmware")]
    IncompatibleFirmware,
    #[error("corrupt data")]
    CorruptData,
    #[error("state sync failed")]
    StateSync,
    #[error("state sync timed out")]
    StateSyncTimedOut,
}

/// Unified error type for device calls
#[derive(Debug, Error)]
pub enum DeviceError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to switcher at {address}: {reason}")]
    ConnectFailed {
        address: String,
        reason: ConnectFailure,
    },

    #[error("Switcher not connected")]
    NotConnected,

    // ── Enumeration errors ───────────────────────────────────────────
    #[error("Mix effect block {index} not found")]
    MixEffectNotFound { index: usize },

    #[error("Failed to enumerate {what}: {message}")]
    Enumeration { what: &'static str, message: String },

    // ── Call errors ──────────────────────────────────────────────────
    #[error("Device call {operation} failed: {message}")]
    Call {
        operation: &'static str,
        message: String,
    },

    #[error("Callback {0} is not registered")]
    UnknownCallback(CallbackId),
}

impl DeviceError {
    /// Shorthand for a failed device call
    pub fn call(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Call {
            operation,
            message: message.into(),
        }
    }
}
