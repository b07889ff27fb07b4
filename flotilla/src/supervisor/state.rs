//! VM lifecycle status and state machine.

use chrono::{DateTime, Utc};
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use serde::{Deserialize, Serialize};

/// Busy-device restarts allowed per VM.
pub const MAX_START_RETRIES: u32 = 1;

/// Lifecycle status of a fleet member.
///
/// ```text
/// Pending ─► Provisioning ─► Starting ─► Running
///    │             │          │  ▲
///    │             │          └──┘ one busy-device retry
///    └─────────────┴──────────┴────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Waiting for preflight.
    Pending,
    /// Storage and network being prepared.
    Provisioning,
    /// Create/start in progress.
    Starting,
    Running,
    /// Terminal; the reason is kept alongside.
    Failed,
}

impl VmStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Running | VmStatus::Failed)
    }

    pub fn can_transition_to(&self, target: VmStatus) -> bool {
        use VmStatus::*;
        matches!(
            (self, target),
            (Pending, Provisioning)
                | (Pending, Failed)
                | (Provisioning, Starting)
                | (Provisioning, Failed)
                // Busy-device retry, bounded by VmState
                | (Starting, Starting)
                | (Starting, Running)
                | (Starting, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Pending => "pending",
            VmStatus::Provisioning => "provisioning",
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dynamic VM state during one launch pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmState {
    pub status: VmStatus,
    pub start_retries: u32,
    pub last_updated: DateTime<Utc>,
}

impl VmState {
    pub fn new() -> Self {
        Self {
            status: VmStatus::Pending,
            start_retries: 0,
            last_updated: Utc::now(),
        }
    }

    /// Attempt state transition with validation.
    ///
    /// `Starting -> Starting` consumes the retry budget; once spent the
    /// transition is rejected.
    pub fn transition_to(&mut self, new_status: VmStatus) -> FlotillaResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(FlotillaError::InvalidState(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            )));
        }

        if self.status == VmStatus::Starting && new_status == VmStatus::Starting {
            if self.start_retries >= MAX_START_RETRIES {
                return Err(FlotillaError::InvalidState(format!(
                    "start retry budget of {} exhausted",
                    MAX_START_RETRIES
                )));
            }
            self.start_retries += 1;
        }

        self.status = new_status;
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Move to Failed from any non-terminal status.
    pub fn mark_failed(&mut self) {
        if !self.status.is_terminal() {
            self.status = VmStatus::Failed;
            self.last_updated = Utc::now();
        }
    }

    pub fn can_retry_start(&self) -> bool {
        self.status == VmStatus::Starting && self.start_retries < MAX_START_RETRIES
    }
}

impl Default for VmState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = VmState::new();
        state.transition_to(VmStatus::Provisioning).unwrap();
        state.transition_to(VmStatus::Starting).unwrap();
        state.transition_to(VmStatus::Running).unwrap();
        assert_eq!(state.status, VmStatus::Running);
        assert_eq!(state.start_retries, 0);
    }

    #[test]
    fn test_single_retry_allowed() {
        let mut state = VmState::new();
        state.transition_to(VmStatus::Provisioning).unwrap();
        state.transition_to(VmStatus::Starting).unwrap();

        assert!(state.can_retry_start());
        state.transition_to(VmStatus::Starting).unwrap();
        assert_eq!(state.start_retries, 1);

        assert!(!state.can_retry_start());
        let err = state.transition_to(VmStatus::Starting).unwrap_err();
        assert!(matches!(err, FlotillaError::InvalidState(_)));
        assert_eq!(state.start_retries, 1);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = VmState::new();
        assert!(state.transition_to(VmStatus::Running).is_err());
        assert!(state.transition_to(VmStatus::Starting).is_err());

        state.transition_to(VmStatus::Failed).unwrap();
        assert!(state.transition_to(VmStatus::Provisioning).is_err());
    }

    #[test]
    fn test_mark_failed_keeps_running() {
        let mut state = VmState::new();
        state.mark_failed();
        assert_eq!(state.status, VmStatus::Failed);

        let mut running = VmState {
            status: VmStatus::Running,
            ..VmState::new()
        };
        running.mark_failed();
        assert_eq!(running.status, VmStatus::Running);
    }
}
