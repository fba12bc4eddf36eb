//! Outcome of checking that key material moved onto the token
//!
//! A `VerificationResult` is only ever turned into a `VerifiedTransfer`
//! when it is fully positive. The backup builder takes the latter, so an
//! unverified transfer cannot reach it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::SlotMap;
use crate::identity::KeyIdentity;
use crate::types::{Fingerprint, KeySlot};

/// Token that marks a key file as a reference to a key held on a card
///
/// Present in both the legacy S-expression and the extended key format.
pub const SHADOWED_KEY_MARKER: &[u8] = b"shadowed-private-key";

/// A key file found in the host key store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubFile {
    pub path: PathBuf,
    pub size: u64,
    /// The file names a card instead of carrying key material
    #[serde(default)]
    pub shadowed: bool,
}

impl StubFile {
    /// Classify a key file from its contents
    pub fn from_contents(path: PathBuf, data: &[u8]) -> Self {
        Self {
            path,
            size: data.len() as u64,
            shadowed: is_shadowed_key(data),
        }
    }

    /// Whether the file still carries private key material
    ///
    /// Anything that is not a card stub does; so does a stub above the
    /// size threshold.
    pub fn holds_private_key(&self, threshold: u64) -> bool {
        !self.shadowed || self.size > threshold
    }
}

/// Whether a key file's contents are a card stub
pub fn is_shadowed_key(data: &[u8]) -> bool {
    data.windows(SHADOWED_KEY_MARKER.len())
        .any(|w| w == SHADOWED_KEY_MARKER)
}

/// Result of checking one hardware slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCheck {
    pub slot: KeySlot,
    pub present: bool,
    /// Reference printed by the card, if any
    pub reference: Option<String>,
    /// Fingerprint the identity expects in this slot
    pub expected: Option<Fingerprint>,
}

impl SlotCheck {
    /// Build slot checks from parsed occupancy and the expected identity
    pub fn from_slots(slots: &SlotMap, identity: Option<&KeyIdentity>) -> Vec<Self> {
        slots
            .iter()
            .map(|(slot, state)| SlotCheck {
                slot,
                present: state.is_occupied(),
                reference: match state {
                    crate::device::SlotState::Occupied { reference } => Some(reference.clone()),
                    crate::device::SlotState::Empty => None,
                },
                expected: identity.map(|id| id.subkey(slot).fingerprint.clone()),
            })
            .collect()
    }

    /// Whether the card holds a different key than expected
    ///
    /// Only decidable when the reference parses as a fingerprint.
    pub fn is_mismatched(&self) -> bool {
        let (Some(reference), Some(expected)) = (&self.reference, &self.expected) else {
            return false;
        };
        match Fingerprint::parse(reference) {
            Ok(actual) => &actual != expected,
            Err(_) => false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.present && !self.is_mismatched()
    }
}

/// Verification outcome handed to the mode controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub slots: Vec<SlotCheck>,
    /// Every key file examined in the host key store
    pub stub_files: Vec<StubFile>,
    /// Size above which a key file counts as full private key material
    pub stub_threshold: u64,
    /// Mediator restarts consumed while verifying
    pub retries: u32,
    /// Card status text the slots were read from
    pub raw_status: String,
    pub checked_at: DateTime<Utc>,
}

impl VerificationResult {
    /// All slots occupied with the expected keys and only card stubs on the host
    pub fn is_fully_positive(&self) -> bool {
        self.slots.len() == KeySlot::ALL.len()
            && self.slots.iter().all(SlotCheck::is_ok)
            && self.leftover_keys().is_empty()
    }

    pub fn missing_slots(&self) -> Vec<KeySlot> {
        self.slots
            .iter()
            .filter(|c| !c.present)
            .map(|c| c.slot)
            .collect()
    }

    pub fn mismatched_slots(&self) -> Vec<KeySlot> {
        self.slots
            .iter()
            .filter(|c| c.is_mismatched())
            .map(|c| c.slot)
            .collect()
    }

    /// Host key files that still carry private key material
    pub fn leftover_keys(&self) -> Vec<&StubFile> {
        self.stub_files
            .iter()
            .filter(|f| f.holds_private_key(self.stub_threshold))
            .collect()
    }

    /// Promote to a verified transfer, handing the result back if negative
    pub fn into_verified(self) -> std::result::Result<VerifiedTransfer, VerificationResult> {
        if self.is_fully_positive() {
            Ok(VerifiedTransfer { result: self })
        } else {
            Err(self)
        }
    }

    /// Operator-facing diagnostic block
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Transfer Verification Report ===\n\n");
        report.push_str("Slots:\n");
        for check in &self.slots {
            let mark = if check.is_ok() { "✓" } else { "✗" };
            let reference = check.reference.as_deref().unwrap_or("none");
            report.push_str(&format!("  {} {:<15} {}\n", mark, check.slot, reference));
            if check.is_mismatched() {
                if let Some(expected) = &check.expected {
                    report.push_str(&format!("      expected {}\n", expected));
                }
            }
        }

        report.push_str(&format!(
            "\nHost key files (threshold {} bytes):\n",
            self.stub_threshold
        ));
        if self.stub_files.is_empty() {
            report.push_str("  (none examined)\n");
        }
        for stub in &self.stub_files {
            let flag = if !stub.shadowed {
                "  <-- not a card stub, private key still on disk"
            } else if stub.size > self.stub_threshold {
                "  <-- full private key still on disk"
            } else {
                ""
            };
            report.push_str(&format!(
                "  {:>6} bytes  {}{}\n",
                stub.size,
                stub.path.display(),
                flag
            ));
        }

        report.push_str(&format!("\nMediator restarts: {}\n", self.retries));

        if self.is_fully_positive() {
            report.push_str("\n✓ All checks passed\n");
            return report;
        }

        report.push_str("\nSuspected causes:\n");
        let missing = self.missing_slots();
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
            report.push_str(&format!(
                "  - keytocard did not complete for: {}\n",
                names.join(", ")
            ));
        }
        let mismatched = self.mismatched_slots();
        if !mismatched.is_empty() {
            report.push_str("  - card holds keys from a different identity\n");
        }
        if !self.leftover_keys().is_empty() {
            report.push_str(
                "  - private key was referenced but not moved (save not issued or agent cache stale)\n",
            );
        }

        report.push_str("\nSuggested remediation:\n");
        report.push_str("  gpgconf --kill gpg-agent scdaemon\n");
        report.push_str("  gpg --card-status\n");
        report.push_str("  ls -la ~/.gnupg/private-keys-v1.d/\n");

        report.push_str("\nRaw card status:\n");
        for line in self.raw_status.lines() {
            report.push_str("  | ");
            report.push_str(line);
            report.push('\n');
        }

        report
    }
}

/// Proof that a transfer passed verification
#[derive(Debug, Clone)]
pub struct VerifiedTransfer {
    result: VerificationResult,
}

impl VerifiedTransfer {
    pub fn result(&self) -> &VerificationResult {
        &self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(present: [bool; 3], stubs: &[u64]) -> VerificationResult {
        VerificationResult {
            slots: KeySlot::ALL
                .iter()
                .zip(present)
                .map(|(slot, present)| SlotCheck {
                    slot: *slot,
                    present,
                    reference: present.then(|| "ABCD".to_string()),
                    expected: None,
                })
                .collect(),
            stub_files: stubs
                .iter()
                .enumerate()
                .map(|(i, size)| StubFile {
                    path: PathBuf::from(format!("{i}.key")),
                    size: *size,
                    shadowed: true,
                })
                .collect(),
            stub_threshold: 1024,
            retries: 0,
            raw_status: "Signature key ....: [none]".to_string(),
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn test_fully_positive() {
        let r = result([true; 3], &[300, 310, 290]);
        assert!(r.is_fully_positive());
        assert!(r.into_verified().is_ok());
    }

    #[test]
    fn test_missing_signature_slot() {
        let r = result([false, true, true], &[]);
        assert!(!r.is_fully_positive());
        assert_eq!(r.missing_slots(), vec![KeySlot::Signature]);
        assert!(r.report().contains("keytocard did not complete for: signature"));
    }

    #[test]
    fn test_oversized_stub_is_negative() {
        let r = result([true; 3], &[300, 2048]);
        assert!(!r.is_fully_positive());
        assert_eq!(r.leftover_keys().len(), 1);
        let report = r.report();
        assert!(report.contains("full private key still on disk"));
        assert!(report.contains("Raw card status"));
    }

    #[test]
    fn test_small_unshadowed_key_is_negative() {
        let mut r = result([true; 3], &[300, 310]);
        r.stub_files.push(StubFile::from_contents(
            PathBuf::from("2.key"),
            b"(11:private-key(3:ecc(5:curve7:Ed25519)(5:flags5:eddsa)(1:q33:@0123456789abcdef0123456789abcdef)(1:d32:0123456789abcdef0123456789abcdef)))",
        ));
        assert!(r.stub_files[2].size < r.stub_threshold);
        assert!(!r.is_fully_positive());
        assert_eq!(r.leftover_keys().len(), 1);
        assert!(r.report().contains("not a card stub"));
    }

    #[test]
    fn test_shadowed_marker_detection() {
        assert!(is_shadowed_key(
            b"(20:shadowed-private-key(3:ecc(5:curve7:Ed25519)(8:shadowed5:t1-v1(16:D276000124010304)))"
        ));
        assert!(is_shadowed_key(
            b"Created: 20240101T000000\nKey: (shadowed-private-key (ecc (curve Ed25519)))\n"
        ));
        assert!(!is_shadowed_key(b"(21:protected-private-key(3:ecc))"));
        assert!(!is_shadowed_key(b""));
    }

    #[test]
    fn test_mismatched_fingerprint() {
        let check = SlotCheck {
            slot: KeySlot::Encryption,
            present: true,
            reference: Some("1".repeat(40)),
            expected: Some(Fingerprint::parse(&"2".repeat(40)).unwrap()),
        };
        assert!(check.is_mismatched());
        assert!(!check.is_ok());
    }
}
