//! Backup directory creation and loading
//!
//! A backup can only be built from a [`VerifiedTransfer`]. The directory
//! holds the public key, an optional pre-transfer snapshot of the secret
//! subkeys, the card status, the SSH public key, a checksummed manifest and
//! human-readable recovery notes.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keyward_core::{ArtifactEntry, BackupManifest, Device, KeyIdentity, VerifiedTransfer};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{ProvisionError, Result};
use crate::service::SmartcardService;

pub const PUBLIC_KEY_FILE: &str = "public-key.asc";
pub const SUBKEYS_FILE: &str = "subkeys.asc";
pub const CARD_STATUS_FILE: &str = "card-status.txt";
pub const SSH_KEY_FILE: &str = "ssh-public-key.pub";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const RECOVERY_FILE: &str = "RECOVERY.md";

/// Suffixes tried after the timestamped name before giving up
const NAME_ATTEMPTS: u32 = 100;

/// Armored secret subkeys exported before they were moved to the token
pub struct SubkeySnapshot {
    armored: Zeroizing<Vec<u8>>,
}

impl SubkeySnapshot {
    pub fn new(armored: Vec<u8>) -> Self {
        Self {
            armored: Zeroizing::new(armored),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.armored
    }
}

impl fmt::Debug for SubkeySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubkeySnapshot")
            .field("len", &self.armored.len())
            .finish()
    }
}

/// Where a backup was written and what it contains
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub dir: PathBuf,
    pub manifest: BackupManifest,
}

/// Writes backup directories under a root
pub struct BackupBuilder {
    service: Arc<dyn SmartcardService>,
    root: PathBuf,
}

impl BackupBuilder {
    pub fn new(service: Arc<dyn SmartcardService>, root: PathBuf) -> Self {
        Self { service, root }
    }

    /// Build a backup for a verified transfer
    ///
    /// Any failure is an `Archive` error; the transfer itself stands.
    pub async fn build(
        &self,
        identity: &KeyIdentity,
        verified: &VerifiedTransfer,
        snapshot: Option<&SubkeySnapshot>,
    ) -> Result<BackupOutcome> {
        self.build_inner(identity, verified, snapshot)
            .await
            .map_err(|e| match e {
                ProvisionError::Archive(_) => e,
                other => ProvisionError::Archive(other.to_string()),
            })
    }

    async fn build_inner(
        &self,
        identity: &KeyIdentity,
        verified: &VerifiedTransfer,
        snapshot: Option<&SubkeySnapshot>,
    ) -> Result<BackupOutcome> {
        let master = &identity.master.fingerprint;
        let public_key = self.service.export_public(master).await?;
        if public_key.is_empty() {
            return Err(ProvisionError::Archive(format!(
                "public key export for {} was empty",
                master
            )));
        }
        let ssh_key = match self.service.export_ssh(master).await {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("SSH public key not exported: {}", e);
                None
            }
        };
        let card_status = &verified.result().raw_status;

        let stem = format!(
            "keyward-{}-{}",
            master.short(),
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ")
        );
        let partial = PartialDir::create(&self.root, &stem)?;
        let dir = partial.path().to_path_buf();

        let subkeys: BTreeMap<_, _> = identity
            .subkeys()
            .map(|(slot, handle)| (slot, handle.fingerprint.clone()))
            .collect();
        let serial = Device::from_card_status(card_status).ok().map(|d| d.serial);
        let mut manifest = BackupManifest::new(master.clone(), subkeys, serial);

        write_file(&dir, PUBLIC_KEY_FILE, &public_key, false)?;
        manifest.artifacts.push(ArtifactEntry::new(
            PUBLIC_KEY_FILE,
            &public_key,
            true,
            "armored public key with all subkeys; import on any new host",
        ));

        match snapshot {
            Some(snapshot) => {
                write_file(&dir, SUBKEYS_FILE, snapshot.as_bytes(), true)?;
                manifest.artifacts.push(ArtifactEntry::new(
                    SUBKEYS_FILE,
                    snapshot.as_bytes(),
                    true,
                    "secret subkeys as generated, before transfer; `keyward load` writes them to a replacement token",
                ));
            }
            None => manifest.not_recoverable.push(
                "secret subkeys: no pre-transfer copy was captured, a lost token means new subkeys"
                    .to_string(),
            ),
        }

        write_file(&dir, CARD_STATUS_FILE, card_status.as_bytes(), false)?;
        manifest.artifacts.push(ArtifactEntry::new(
            CARD_STATUS_FILE,
            card_status.as_bytes(),
            false,
            "token status at verification time",
        ));

        if let Some(ssh_key) = &ssh_key {
            write_file(&dir, SSH_KEY_FILE, ssh_key.as_bytes(), false)?;
            manifest.artifacts.push(ArtifactEntry::new(
                SSH_KEY_FILE,
                ssh_key.as_bytes(),
                true,
                "authentication key in OpenSSH format for authorized_keys",
            ));
        }

        manifest.not_recoverable.push(
            "private keys inside the token: they cannot be exported and are lost with the device"
                .to_string(),
        );
        manifest
            .not_recoverable
            .push("user and admin PINs: never written anywhere".to_string());

        let json = serde_json::to_vec_pretty(&manifest)?;
        write_file(&dir, MANIFEST_FILE, &json, false)?;
        write_file(&dir, RECOVERY_FILE, manifest.recovery_text().as_bytes(), false)?;

        let dir = partial.keep();
        info!(path = %dir.display(), "Backup written");
        Ok(BackupOutcome { dir, manifest })
    }
}

/// Fresh backup directory, removed on drop unless kept
struct PartialDir {
    path: PathBuf,
    kept: bool,
}

impl PartialDir {
    /// Create `root/stem`, or `root/stem-N` when that name is taken
    fn create(root: &Path, stem: &str) -> Result<Self> {
        fs::create_dir_all(root)?;
        for attempt in 1..=NAME_ATTEMPTS {
            let name = match attempt {
                1 => stem.to_string(),
                n => format!("{}-{}", stem, n),
            };
            let path = root.join(name);
            match fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path, kept: false }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ProvisionError::Archive(format!(
            "no free backup directory name for {} under {}",
            stem,
            root.display()
        )))
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) -> PathBuf {
        self.kept = true;
        self.path.clone()
    }
}

impl Drop for PartialDir {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => warn!(path = %self.path.display(), "Removed incomplete backup"),
            Err(e) => warn!(
                path = %self.path.display(),
                "Incomplete backup left behind: {}", e
            ),
        }
    }
}

fn write_file(dir: &Path, name: &str, data: &[u8], private: bool) -> Result<()> {
    let path = dir.join(name);
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if private { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = private;
    let mut file = options.open(&path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

/// A backup directory opened for `load`
#[derive(Debug)]
pub struct BackupBundle {
    pub dir: PathBuf,
    pub manifest: BackupManifest,
    public_key: Vec<u8>,
    subkeys: Option<SubkeySnapshot>,
}

impl BackupBundle {
    /// Read the manifest and check every artifact against its checksum
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let json = fs::read(&manifest_path).map_err(|e| {
            ProvisionError::Precondition(format!("cannot read {}: {}", manifest_path.display(), e))
        })?;
        let manifest: BackupManifest = serde_json::from_slice(&json)
            .map_err(|e| ProvisionError::Precondition(format!("malformed manifest: {}", e)))?;

        let mut public_key = None;
        let mut subkeys = None;
        for artifact in &manifest.artifacts {
            let path = dir.join(&artifact.name);
            let data = fs::read(&path).map_err(|e| {
                ProvisionError::Precondition(format!("cannot read {}: {}", path.display(), e))
            })?;
            if !artifact.matches(&data) {
                return Err(ProvisionError::Precondition(format!(
                    "checksum mismatch for {}",
                    artifact.name
                )));
            }
            match artifact.name.as_str() {
                PUBLIC_KEY_FILE => public_key = Some(data),
                SUBKEYS_FILE => subkeys = Some(SubkeySnapshot::new(data)),
                _ => {}
            }
        }

        let public_key = public_key.ok_or_else(|| {
            ProvisionError::Precondition(format!("{} missing from backup", PUBLIC_KEY_FILE))
        })?;

        info!(
            path = %dir.display(),
            master = %manifest.master_fingerprint,
            "Backup checksums verified"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            public_key,
            subkeys,
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Secret subkeys to load onto a token
    pub fn snapshot(&self) -> Result<&SubkeySnapshot> {
        self.subkeys.as_ref().ok_or_else(|| {
            ProvisionError::Precondition(format!(
                "backup at {} has no {}; it cannot be loaded onto a token",
                self.dir.display(),
                SUBKEYS_FILE
            ))
        })
    }
}
