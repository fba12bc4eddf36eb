//! Keyward Core - Shared types for hardware token provisioning
//!
//! This crate holds the data model shared by the provisioning workflow and
//! its tests: key slots and usages, the parsed view of an attached token,
//! the key identity being provisioned, verification results, the backup
//! manifest, retry policy and log redaction.

pub mod device;
pub mod error;
pub mod identity;
pub mod manifest;
pub mod redact;
pub mod retry;
pub mod types;
pub mod verification;

pub use device::{Device, PinRetryCounters, SlotMap, SlotState};
pub use error::{Error, Result};
pub use identity::{KeyHandle, KeyIdentity, UserId};
pub use manifest::{sha256_hex, ArtifactEntry, BackupManifest};
pub use redact::{RedactionGuard, Redactor, REDACTED};
pub use retry::{RestartBudget, RetryPolicy};
pub use types::{Fingerprint, KeyKind, KeySlot, KeyUsage, Keygrip, TouchPolicy};
pub use verification::{
    is_shadowed_key, SlotCheck, StubFile, VerificationResult, VerifiedTransfer, SHADOWED_KEY_MARKER,
};

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Stub files larger than this are treated as full private keys
pub const DEFAULT_STUB_THRESHOLD: u64 = 1024;

/// Default bound for one key-to-card dialogue, touch confirmation included
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 120;

/// Default mediator restart attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Factory default user PIN of an OpenPGP applet
pub const FACTORY_USER_PIN: &str = "123456";

/// Factory default admin PIN of an OpenPGP applet
pub const FACTORY_ADMIN_PIN: &str = "12345678";
