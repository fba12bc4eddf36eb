//! Error types for the provisioning workflow

use std::time::Duration;

use thiserror::Error;

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors that can occur while provisioning a token
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] keyward_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing dependency, no device, malformed identity or backup
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Mediator broken pipe or card error that outlived its restarts
    #[error("Hardware communication failed: {0}")]
    HardwareCommunication(String),

    /// Verification found the key material was not moved
    #[error("Transfer verification failed: {summary}")]
    TransferStructural {
        summary: String,
        /// Full diagnostic block for the operator
        report: String,
    },

    /// PIN rejected by the token or not confirmed by the operator
    #[error("PIN error: {0}")]
    Pin(String),

    /// The interactive session waited longer than its bound
    #[error("Timed out after {elapsed:?} waiting for {waiting_for}")]
    DialogueTimeout {
        waiting_for: String,
        elapsed: Duration,
    },

    /// The interactive session produced something unexpected
    #[error("Interactive session failed: {0}")]
    Dialogue(String),

    /// Backup could not be written; the transfer itself stands
    #[error("Backup failed: {0}")]
    Archive(String),

    /// Operator declined a confirmation
    #[error("Cancelled by operator")]
    Cancelled,

    /// A smartcard service command failed
    #[error("Smartcard service error: {0}")]
    Service(String),

    /// Workflow attempted an illegal state transition
    #[error("Invalid workflow transition: {0}")]
    InvalidTransition(String),
}

/// Coarse classification used for retry and exit-code decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Precondition,
    Communication,
    Structural,
    Pin,
    Timeout,
    Archive,
    Cancelled,
    Other,
}

impl ProvisionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProvisionError::Precondition(_) | ProvisionError::Config(_) => ErrorClass::Precondition,
            ProvisionError::Core(keyward_core::Error::NoCard(_))
            | ProvisionError::Core(keyward_core::Error::InvalidUserId(_)) => {
                ErrorClass::Precondition
            }
            ProvisionError::HardwareCommunication(_) => ErrorClass::Communication,
            ProvisionError::TransferStructural { .. } => ErrorClass::Structural,
            ProvisionError::Pin(_) => ErrorClass::Pin,
            ProvisionError::DialogueTimeout { .. } => ErrorClass::Timeout,
            ProvisionError::Archive(_) => ErrorClass::Archive,
            ProvisionError::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Other,
        }
    }

    /// Whether a mediator restart may cure this error
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Communication
    }

    /// Detailed operator diagnostic, when the error carries one
    pub fn report(&self) -> Option<&str> {
        match self {
            ProvisionError::TransferStructural { report, .. } => Some(report),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ProvisionError {
    fn from(e: serde_json::Error) -> Self {
        ProvisionError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProvisionError::Precondition("gpg not found".into());
        assert!(err.to_string().contains("gpg not found"));
    }

    #[test]
    fn test_only_communication_errors_retry() {
        assert!(ProvisionError::HardwareCommunication("broken pipe".into()).is_retryable());
        assert!(!ProvisionError::TransferStructural {
            summary: "slot empty".into(),
            report: String::new(),
        }
        .is_retryable());
        assert!(!ProvisionError::DialogueTimeout {
            waiting_for: "touch".into(),
            elapsed: Duration::from_secs(120),
        }
        .is_retryable());
    }

    #[test]
    fn test_no_card_is_precondition() {
        let err = ProvisionError::from(keyward_core::Error::NoCard("no such device".into()));
        assert_eq!(err.class(), ErrorClass::Precondition);
    }
}
