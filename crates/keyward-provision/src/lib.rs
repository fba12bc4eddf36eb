//! Keyward Provision - Hardware token provisioning workflow
//!
//! This crate provides:
//! - The mode controller for the generate, load and backup workflows
//! - Scripted key-to-card dialogues over a pseudo-terminal
//! - Health checks and bounded restarts of the smartcard mediator
//! - Verification that key material left the host
//! - Backup writing and loading, gated on a verified transfer
//! - Redacting log setup and scoped PIN handling

pub mod backup;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod gpg;
pub mod health;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod prompt;
pub mod secret;
pub mod service;
pub mod transfer;
pub mod verify;
pub mod workflow;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backup::{BackupBuilder, BackupBundle, BackupOutcome, SubkeySnapshot};
pub use config::ProvisionConfig;
pub use error::{ErrorClass, ProvisionError, Result};
pub use gpg::GpgService;
pub use health::{FailureSignature, GpgAgentMediator, HealthManager, Mediator};
pub use prompt::{ModeChoice, Operator, TerminalOperator};
pub use secret::{Pin, PinKind, PinPair};
pub use service::SmartcardService;
pub use transfer::{SessionDriver, TransferSession};
pub use verify::TransferVerifier;
pub use workflow::{Collaborators, Mode, ModeParams, Stage, Workflow, WorkflowResult, WorkflowState};
