//! Error taxonomy for fleet orchestration.
//!
//! Errors fall into two scopes:
//! - per-VM (`Preflight`, `Storage`, `Network`, `DeviceBusy`, `Start`, `Timeout`):
//!   recorded as that VM's outcome, never abort the fleet
//! - per-process (`Privilege`, `HostState`): stop the orchestrator before any
//!   VM is attempted

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across all flotilla crates.
pub type FlotillaResult<T> = Result<T, FlotillaError>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FlotillaError {
    /// Host resource headroom is insufficient for a VM.
    #[error("preflight check failed: {0}")]
    Preflight(String),

    /// Rootfs clone, copy or overlay mount failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Tap device allocation or attachment failed.
    #[error("network error: {0}")]
    Network(String),

    /// The VM runtime reported its network device as busy.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// The VM runtime rejected creation or start.
    #[error("start failed: {0}")]
    Start(String),

    /// A bounded runtime call did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The orchestrator lacks the privileges it needs.
    #[error("insufficient privileges: {0}")]
    Privilege(String),

    /// Bridge or NAT bootstrap failed.
    #[error("host network setup failed: {0}")]
    HostState(String),

    /// Host platform cannot run VMs.
    #[error("unsupported host: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// VM runtime process failure outside of start (wait, stop).
    #[error("engine error: {0}")]
    Engine(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FlotillaError {
    /// Only a busy network device is recovered automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlotillaError::DeviceBusy(_))
    }

    /// Host-level errors. Fatal to the run when host network setup hits them.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self, FlotillaError::Privilege(_) | FlotillaError::HostState(_))
    }
}
