//! Backup manifest
//!
//! The manifest enumerates every artifact written to a backup directory
//! together with its checksum, and states explicitly which material cannot
//! be recovered from the backup.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{Fingerprint, KeySlot};
use crate::MANIFEST_VERSION;

/// SHA-256 of `data` as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// One file in the backup directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub sha256: String,
    pub size: u64,
    /// Whether restoring from this artifact recovers usable material
    pub recoverable: bool,
    pub description: String,
}

impl ArtifactEntry {
    pub fn new(name: &str, data: &[u8], recoverable: bool, description: &str) -> Self {
        Self {
            name: name.to_string(),
            sha256: sha256_hex(data),
            size: data.len() as u64,
            recoverable,
            description: description.to_string(),
        }
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        self.size == data.len() as u64 && self.sha256 == sha256_hex(data)
    }
}

/// Written once per backup, never modified afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub master_fingerprint: Fingerprint,
    pub subkey_fingerprints: BTreeMap<KeySlot, Fingerprint>,
    pub device_serial: Option<String>,
    pub artifacts: Vec<ArtifactEntry>,
    pub not_recoverable: Vec<String>,
}

impl BackupManifest {
    pub fn new(
        master_fingerprint: Fingerprint,
        subkey_fingerprints: BTreeMap<KeySlot, Fingerprint>,
        device_serial: Option<String>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
            master_fingerprint,
            subkey_fingerprints,
            device_serial,
            artifacts: Vec::new(),
            not_recoverable: Vec::new(),
        }
    }

    pub fn artifact(&self, name: &str) -> Option<&ArtifactEntry> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// Human-readable recovery notes
    pub fn recovery_text(&self) -> String {
        let mut text = String::new();
        text.push_str("# Keyward backup\n\n");
        text.push_str(&format!(
            "Created: {}\n",
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        text.push_str(&format!("Master key: {}\n", self.master_fingerprint));
        for (slot, fpr) in &self.subkey_fingerprints {
            text.push_str(&format!("{:<15} {}\n", format!("{slot} subkey:"), fpr));
        }
        if let Some(serial) = &self.device_serial {
            text.push_str(&format!("Token serial: {}\n", serial));
        }

        text.push_str("\n## Recoverable from this backup\n\n");
        for artifact in self.artifacts.iter().filter(|a| a.recoverable) {
            text.push_str(&format!("- `{}`: {}\n", artifact.name, artifact.description));
        }

        text.push_str("\n## Reference only\n\n");
        for artifact in self.artifacts.iter().filter(|a| !a.recoverable) {
            text.push_str(&format!("- `{}`: {}\n", artifact.name, artifact.description));
        }

        text.push_str("\n## NOT recoverable\n\n");
        for item in &self.not_recoverable {
            text.push_str(&format!("- {}\n", item));
        }

        text.push_str("\nChecksums (SHA-256):\n\n");
        for artifact in &self.artifacts {
            text.push_str(&format!("    {}  {}\n", artifact.sha256, artifact.name));
        }

        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fpr(c: char) -> Fingerprint {
        Fingerprint::parse(&c.to_string().repeat(40)).unwrap()
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_artifact_matches() {
        let entry = ArtifactEntry::new("public-key.asc", b"key", true, "public key");
        assert!(entry.matches(b"key"));
        assert!(!entry.matches(b"kex"));
    }

    #[test]
    fn test_recovery_text_lists_sections() {
        let mut subkeys = BTreeMap::new();
        subkeys.insert(KeySlot::Signature, fpr('1'));
        let mut manifest = BackupManifest::new(fpr('A'), subkeys, Some("12345678".into()));
        manifest
            .artifacts
            .push(ArtifactEntry::new("public-key.asc", b"pk", true, "public key"));
        manifest
            .artifacts
            .push(ArtifactEntry::new("card-status.txt", b"st", false, "status snapshot"));
        manifest
            .not_recoverable
            .push("private keys stored on the token".to_string());

        let text = manifest.recovery_text();
        assert!(text.contains("## Recoverable from this backup"));
        assert!(text.contains("`public-key.asc`"));
        assert!(text.contains("## NOT recoverable"));
        assert!(text.contains("private keys stored on the token"));
        assert!(text.contains("12345678"));
    }

    #[test]
    fn test_manifest_json_round_trip() {
        let manifest = BackupManifest::new(fpr('A'), BTreeMap::new(), None);
        let json = serde_json::to_string(&manifest).unwrap();
        let back: BackupManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }
}
