//! Per-action outcomes and the apply summary.

use serde::Serialize;
use std::fmt;

use crate::error::{ApplyError, EXIT_CONFLICT, EXIT_LOCK_HELD, KeystoneError};
use crate::model::ResourceAddress;
use crate::planner::{ChangeAction, ChangeKind};

/// Status of one action during an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// Not dispatched yet.
    Pending,
    /// Dispatched to a worker.
    Running,
    /// Finished and committed.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Never ran.
    Skipped,
}

impl ActionStatus {
    /// Returns true for `Succeeded`, `Failed` and `Skipped`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Legal moves: `pending → running | skipped` and
    /// `running → succeeded | failed | skipped`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Succeeded | Self::Failed | Self::Skipped)
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why an apply stopped dispatching on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum AbortReason {
    /// A commit saw a serial it did not expect.
    Conflict(String),
    /// The heartbeat found the lock released or reclaimed.
    LockLost(String),
    /// The state backend failed.
    Store(String),
}

impl AbortReason {
    /// Classifies a state error raised during an apply.
    #[must_use]
    pub fn from_error(error: &KeystoneError) -> Self {
        if error.is_conflict() {
            Self::Conflict(error.to_string())
        } else {
            Self::Store(error.to_string())
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(m) => write!(f, "state conflict: {m}"),
            Self::LockLost(m) => write!(f, "lock lost: {m}"),
            Self::Store(m) => write!(f, "state backend failure: {m}"),
        }
    }
}

/// What happened to one planned action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// Action key, see [`ChangeAction::key`].
    pub key: String,
    /// Resource address.
    pub address: ResourceAddress,
    /// Planned kind.
    pub kind: ChangeKind,
    /// Final status.
    pub status: ActionStatus,
    /// Error or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider attempts made, retries included.
    pub attempts: u32,
    /// Provider id after the action, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl ActionOutcome {
    /// A pending outcome for `action`.
    #[must_use]
    pub fn pending(action: &ChangeAction) -> Self {
        Self {
            key: action.key(),
            address: action.address.clone(),
            kind: action.kind,
            status: ActionStatus::Pending,
            error: None,
            attempts: 0,
            provider_id: None,
        }
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError::InvalidTransition` for an illegal move; the
    /// outcome is left unchanged.
    pub fn transition(&mut self, next: ActionStatus) -> Result<(), ApplyError> {
        if !self.status.can_transition_to(next) {
            return Err(ApplyError::InvalidTransition {
                address: self.key.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    /// Outcomes in plan order.
    pub outcomes: Vec<ActionOutcome>,
    /// Serial the apply started from.
    pub initial_serial: u64,
    /// Serial after the last commit.
    pub final_serial: u64,
    /// True if the caller cancelled the apply.
    pub cancelled: bool,
    /// Why the apply stopped dispatching on its own, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortReason>,
    /// Wall time of the apply.
    pub duration_ms: u64,
}

impl ApplyResult {
    fn count(&self, status: ActionStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Number of succeeded actions.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(ActionStatus::Succeeded)
    }

    /// Number of failed actions.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(ActionStatus::Failed)
    }

    /// Number of skipped actions.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(ActionStatus::Skipped)
    }

    /// Returns true if every action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.aborted.is_none()
            && self.outcomes.iter().all(|o| o.status == ActionStatus::Succeeded)
    }

    /// Outcome of the action with `key`.
    #[must_use]
    pub fn outcome(&self, key: &str) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| o.key == key)
    }

    /// Number of commits made.
    #[must_use]
    pub const fn commits(&self) -> u64 {
        self.final_serial.saturating_sub(self.initial_serial)
    }

    /// Process exit code: 0 on full success, 4 after a state conflict, 3
    /// after losing the lock, 2 for any other partial failure.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match &self.aborted {
            Some(AbortReason::Conflict(_)) => EXIT_CONFLICT,
            Some(AbortReason::LockLost(_)) => EXIT_LOCK_HELD,
            _ if self.is_success() => 0,
            _ => 2,
        }
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            if outcome.kind == ChangeKind::Noop {
                continue;
            }
            write!(f, "  {:<9} {} {}", outcome.status.to_string(), outcome.kind, outcome.key)?;
            if let Some(error) = &outcome.error {
                write!(f, ": {error}")?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "Apply {}: {} succeeded, {} failed, {} skipped (serial {} -> {})",
            if self.is_success() { "complete" } else { "incomplete" },
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.initial_serial,
            self.final_serial
        )
    }
}
