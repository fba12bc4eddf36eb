//! Workflow state machine
//!
//! Every stage change goes through [`StateMachine::advance`], which checks
//! the edge table. Entering [`Stage::BackedUp`] also needs a fully positive
//! verification recorded in the machine.

use std::fmt;

use keyward_core::{VerificationResult, VerifiedTransfer};

use crate::error::{ProvisionError, Result};

/// Non-terminal progress of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Idle,
    DeviceDetected,
    Initialized,
    MaterialReady,
    Transferring,
    Verifying,
    Verified,
    PostConfig,
    BackedUp,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Idle,
        Stage::DeviceDetected,
        Stage::Initialized,
        Stage::MaterialReady,
        Stage::Transferring,
        Stage::Verifying,
        Stage::Verified,
        Stage::PostConfig,
        Stage::BackedUp,
        Stage::Done,
    ];

    fn name(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::DeviceDetected => "device detected",
            Stage::Initialized => "initialized",
            Stage::MaterialReady => "material ready",
            Stage::Transferring => "transferring",
            Stage::Verifying => "verifying",
            Stage::Verified => "verified",
            Stage::PostConfig => "post-configuration",
            Stage::BackedUp => "backed up",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Legal stage changes
///
/// Backup mode takes the three shortcuts out of `DeviceDetected`,
/// `MaterialReady` and `Verified`.
const EDGES: &[(Stage, Stage)] = &[
    (Stage::Idle, Stage::DeviceDetected),
    (Stage::DeviceDetected, Stage::Initialized),
    (Stage::DeviceDetected, Stage::MaterialReady),
    (Stage::Initialized, Stage::MaterialReady),
    (Stage::MaterialReady, Stage::Transferring),
    (Stage::MaterialReady, Stage::Verifying),
    (Stage::Transferring, Stage::Verifying),
    (Stage::Verifying, Stage::Verified),
    (Stage::Verified, Stage::PostConfig),
    (Stage::Verified, Stage::BackedUp),
    (Stage::PostConfig, Stage::BackedUp),
    (Stage::BackedUp, Stage::Done),
];

pub fn is_legal(from: Stage, to: Stage) -> bool {
    EDGES.contains(&(from, to))
}

/// Where a workflow run stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Active(Stage),
    /// Terminal failure in `stage`
    Failed { stage: Stage, backup_attempted: bool },
    /// Terminal: the operator declined a confirmation or closed input
    Cancelled { stage: Stage },
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowState::Active(stage) if *stage != Stage::Done)
    }

    /// Stage reached, or the stage the run ended in
    pub fn stage(&self) -> Stage {
        match *self {
            WorkflowState::Active(stage)
            | WorkflowState::Failed { stage, .. }
            | WorkflowState::Cancelled { stage } => stage,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Active(stage) => write!(f, "{}", stage),
            WorkflowState::Failed {
                stage,
                backup_attempted,
            } => write!(
                f,
                "failed during {} (backup {})",
                stage,
                if *backup_attempted { "attempted" } else { "not attempted" }
            ),
            WorkflowState::Cancelled { stage } => write!(f, "cancelled during {}", stage),
        }
    }
}

/// Sole writer of a run's [`WorkflowState`]
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: WorkflowState,
    history: Vec<Stage>,
    verification: Option<VerificationResult>,
    backup_attempted: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: WorkflowState::Active(Stage::Idle),
            history: vec![Stage::Idle],
            verification: None,
            backup_attempted: false,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Stages entered so far, in order
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    pub fn verification(&self) -> Option<&VerificationResult> {
        self.verification.as_ref()
    }

    pub fn backup_attempted(&self) -> bool {
        self.backup_attempted
    }

    /// Move to `to` along a legal edge
    pub fn advance(&mut self, to: Stage) -> Result<()> {
        let from = match self.state {
            WorkflowState::Active(stage) if stage != Stage::Done => stage,
            other => {
                return Err(ProvisionError::InvalidTransition(format!(
                    "{} is terminal, cannot enter {}",
                    other, to
                )))
            }
        };
        if !is_legal(from, to) {
            return Err(ProvisionError::InvalidTransition(format!(
                "{} -> {}",
                from, to
            )));
        }
        if to == Stage::BackedUp {
            self.require_positive_verification()?;
        }
        self.state = WorkflowState::Active(to);
        self.history.push(to);
        Ok(())
    }

    /// Keep the proof of a positive verification for the backup gate
    pub fn record_verification(&mut self, verified: &VerifiedTransfer) {
        self.verification = Some(verified.result().clone());
    }

    /// Mark the start of backup writing; fails without a positive verification
    pub fn begin_backup(&mut self) -> Result<()> {
        self.require_positive_verification()?;
        self.backup_attempted = true;
        Ok(())
    }

    fn require_positive_verification(&self) -> Result<()> {
        match &self.verification {
            Some(result) if result.is_fully_positive() => Ok(()),
            _ => Err(ProvisionError::InvalidTransition(
                "backup requires a fully positive verification".to_string(),
            )),
        }
    }

    /// End the run as failed in the current stage
    pub fn fail(&mut self) {
        if let WorkflowState::Active(stage) = self.state {
            self.state = WorkflowState::Failed {
                stage,
                backup_attempted: self.backup_attempted,
            };
        }
    }

    /// End the run as cancelled in the current stage
    pub fn cancel(&mut self) {
        if let WorkflowState::Active(stage) = self.state {
            self.state = WorkflowState::Cancelled { stage };
        }
    }
}
