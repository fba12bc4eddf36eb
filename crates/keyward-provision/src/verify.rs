//! Transfer verification
//!
//! Two independent checks decide whether key material left the host:
//! every slot on the token must hold a key, and every subkey file in the
//! host key store must be a card stub. A file counts as a stub only when it
//! carries the shadowed-key marker and stays under the size threshold; an
//! unprotected ed25519 key is smaller than any sensible threshold, so size
//! alone proves nothing. Communication failures are retried through the
//! health manager; a negative result never is.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use keyward_core::{
    Device, KeyIdentity, Keygrip, SlotCheck, StubFile, VerificationResult, VerifiedTransfer,
};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{ProvisionError, Result};
use crate::health::{FailureSignature, HealthManager};
use crate::service::SmartcardService;

/// Checks slot occupancy and host stubs after a transfer
pub struct TransferVerifier {
    service: Arc<dyn SmartcardService>,
    health: HealthManager,
    stub_dir: PathBuf,
    stub_threshold: u64,
}

impl TransferVerifier {
    pub fn new(
        service: Arc<dyn SmartcardService>,
        health: HealthManager,
        stub_dir: PathBuf,
        stub_threshold: u64,
    ) -> Self {
        Self {
            service,
            health,
            stub_dir,
            stub_threshold,
        }
    }

    /// Verify the transfer and return proof on success
    ///
    /// A negative result is a `TransferStructural` error carrying the full
    /// diagnostic report.
    pub async fn verify(&self, identity: Option<&KeyIdentity>) -> Result<VerifiedTransfer> {
        let result = self.check(identity).await?;
        match result.into_verified() {
            Ok(verified) => {
                info!(
                    "Transfer verified: 3 slots occupied, {} host card stub(s) within {} bytes",
                    verified.result().stub_files.len(),
                    self.stub_threshold
                );
                Ok(verified)
            }
            Err(result) => {
                let summary = summarize(&result);
                warn!("Transfer verification failed: {}", summary);
                Err(ProvisionError::TransferStructural {
                    summary,
                    report: result.report(),
                })
            }
        }
    }

    /// Collect a verification result, positive or not
    pub async fn check(&self, identity: Option<&KeyIdentity>) -> Result<VerificationResult> {
        let mut budget = self.health.policy().budget();
        loop {
            self.health.ensure_healthy_with(&mut budget).await?;

            let status = self.service.card_status().await?;
            if let Some(signature) = FailureSignature::detect(&status) {
                if !budget.try_consume() {
                    return Err(ProvisionError::HardwareCommunication(format!(
                        "card status still reports '{}' after {} restart(s)",
                        signature,
                        budget.used()
                    )));
                }
                warn!(
                    "Card status reports '{}', restarting mediator (attempt {})",
                    signature,
                    budget.used()
                );
                self.health.restart_mediator().await?;
                tokio::time::sleep(self.health.policy().between_attempts).await;
                continue;
            }

            let device = Device::from_card_status(&status)?;
            let stub_files = scan_stubs(&self.stub_dir, identity)?;

            return Ok(VerificationResult {
                slots: SlotCheck::from_slots(&device.slots, identity),
                stub_files,
                stub_threshold: self.stub_threshold,
                retries: budget.used(),
                raw_status: status,
                checked_at: chrono::Utc::now(),
            });
        }
    }
}

/// One-line description of a negative result
fn summarize(result: &VerificationResult) -> String {
    let mut parts = Vec::new();
    let missing = result.missing_slots();
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
        parts.push(format!("empty slot(s): {}", names.join(", ")));
    }
    let mismatched = result.mismatched_slots();
    if !mismatched.is_empty() {
        let names: Vec<String> = mismatched.iter().map(ToString::to_string).collect();
        parts.push(format!("unexpected key in slot(s): {}", names.join(", ")));
    }
    let leftover = result.leftover_keys();
    let unshadowed = leftover.iter().filter(|f| !f.shadowed).count();
    if unshadowed > 0 {
        parts.push(format!(
            "{} key file(s) on host are private keys, not card stubs",
            unshadowed
        ));
    }
    if leftover.len() > unshadowed {
        parts.push(format!(
            "{} key file(s) above {} bytes still on host",
            leftover.len() - unshadowed,
            result.stub_threshold
        ));
    }
    if parts.is_empty() {
        parts.push("incomplete slot information".to_string());
    }
    parts.join("; ")
}

/// Key files to examine in the host key store
///
/// With known subkey keygrips only their files are read; otherwise every
/// `*.key` file except the master key's.
pub fn scan_stubs(dir: &Path, identity: Option<&KeyIdentity>) -> Result<Vec<StubFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    if let Some(grips) = identity.and_then(KeyIdentity::subkey_keygrips) {
        let mut files = Vec::new();
        for grip in grips {
            let path = dir.join(grip.file_name());
            match std::fs::read(&path) {
                Ok(data) => {
                    let data = Zeroizing::new(data);
                    files.push(StubFile::from_contents(path, &data));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        return Ok(files);
    }

    let master_file = identity
        .and_then(|id| id.master.keygrip.as_ref())
        .map(Keygrip::file_name);

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("key") {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if master_file.as_deref() == Some(name.as_str()) {
            continue;
        }
        if entry.metadata()?.is_file() {
            let data = Zeroizing::new(std::fs::read(&path)?);
            files.push(StubFile::from_contents(path, &data));
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        sample_identity, shadowed_stub, FakeCard, FakeMediator, LOADED_STATUS,
        UNSHADOWED_ED25519_KEY,
    };
    use keyward_core::{KeySlot, RetryPolicy};
    use std::time::Duration;
    use tempfile::tempdir;

    fn verifier(card: Arc<FakeCard>, mediator: Arc<FakeMediator>, dir: &Path) -> TransferVerifier {
        let health = HealthManager::new(mediator, RetryPolicy::immediate(3), Duration::ZERO);
        TransferVerifier::new(card, health, dir.to_path_buf(), 1024)
    }

    fn write_stub(dir: &Path, grip: &str, size: usize) {
        std::fs::write(dir.join(format!("{grip}.key")), shadowed_stub(size)).unwrap();
    }

    #[tokio::test]
    async fn test_positive_verification() {
        let dir = tempdir().unwrap();
        let identity = sample_identity();
        for (_, handle) in identity.subkeys() {
            write_stub(dir.path(), handle.keygrip.as_ref().unwrap().as_str(), 300);
        }
        let card = Arc::new(FakeCard::with_status(LOADED_STATUS));
        let mediator = Arc::new(FakeMediator::healthy());

        let verified = verifier(card, mediator, dir.path())
            .verify(Some(&identity))
            .await
            .unwrap();
        assert_eq!(verified.result().stub_files.len(), 3);
        assert_eq!(verified.result().retries, 0);
    }

    #[tokio::test]
    async fn test_oversized_stub_is_structural() {
        let dir = tempdir().unwrap();
        let identity = sample_identity();
        let grip = identity.signing.keygrip.as_ref().unwrap().as_str().to_string();
        write_stub(dir.path(), &grip, 2048);
        let card = Arc::new(FakeCard::with_status(LOADED_STATUS));
        let mediator = Arc::new(FakeMediator::healthy());

        let err = verifier(card, mediator.clone(), dir.path())
            .verify(Some(&identity))
            .await
            .unwrap_err();
        match err {
            ProvisionError::TransferStructural { summary, report } => {
                assert!(summary.contains("above 1024 bytes"));
                assert!(report.contains("2048 bytes"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mediator.restarts(), 0);
    }

    #[tokio::test]
    async fn test_unshadowed_ed25519_key_is_structural() {
        let dir = tempdir().unwrap();
        let identity = sample_identity();
        for (slot, handle) in identity.subkeys() {
            let grip = handle.keygrip.as_ref().unwrap();
            if slot == KeySlot::Encryption {
                std::fs::write(dir.path().join(grip.file_name()), UNSHADOWED_ED25519_KEY).unwrap();
            } else {
                write_stub(dir.path(), grip.as_str(), 300);
            }
        }
        let card = Arc::new(FakeCard::with_status(LOADED_STATUS));
        let mediator = Arc::new(FakeMediator::healthy());
        let checker = verifier(card, mediator, dir.path());

        let result = checker.check(Some(&identity)).await.unwrap();
        assert!(result.stub_files.iter().all(|f| f.size <= 1024));
        assert_eq!(result.leftover_keys().len(), 1);
        assert!(!result.leftover_keys()[0].shadowed);
        assert!(!result.is_fully_positive());

        match checker.verify(Some(&identity)).await.unwrap_err() {
            ProvisionError::TransferStructural { summary, report } => {
                assert!(summary.contains("not card stubs"));
                assert!(report.contains("not a card stub"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_flake_is_retried() {
        let dir = tempdir().unwrap();
        let card = Arc::new(FakeCard::with_status(LOADED_STATUS));
        card.push_status_failures(["gpg: selecting card failed: Card error"]);
        let mediator = Arc::new(FakeMediator::healthy());

        let result = verifier(card, mediator.clone(), dir.path())
            .check(Some(&sample_identity()))
            .await
            .unwrap();
        assert_eq!(result.retries, 1);
        assert_eq!(mediator.restarts(), 1);
        assert!(result.is_fully_positive());
    }

    #[test]
    fn test_scan_without_identity_skips_non_key_files() {
        let dir = tempdir().unwrap();
        write_stub(dir.path(), "AAAA", 10);
        std::fs::write(dir.path().join("notes.txt"), b"not a key").unwrap();
        let files = scan_stubs(dir.path(), None).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_scan_excludes_master_when_grips_unknown() {
        let dir = tempdir().unwrap();
        let mut identity = sample_identity();
        let master_grip = identity.master.keygrip.clone().unwrap();
        identity.signing.keygrip = None;
        write_stub(dir.path(), master_grip.as_str(), 4000);
        write_stub(dir.path(), "B1B1B1B1B1B1B1B1B1B1B1B1B1B1B1B1B1B1B1B1", 200);

        let files = scan_stubs(dir.path(), Some(&identity)).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 200);
    }

    #[test]
    fn test_summary_names_missing_slot() {
        let result = VerificationResult {
            slots: vec![SlotCheck {
                slot: KeySlot::Signature,
                present: false,
                reference: None,
                expected: None,
            }],
            stub_files: Vec::new(),
            stub_threshold: 1024,
            retries: 0,
            raw_status: String::new(),
            checked_at: chrono::Utc::now(),
        };
        assert!(summarize(&result).contains("signature"));
    }
}
