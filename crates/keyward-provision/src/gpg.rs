//! GnuPG and ykman backed smartcard service

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use keyward_core::{
    Fingerprint, KeyHandle, KeyIdentity, KeyKind, KeySlot, KeyUsage, TouchPolicy, UserId,
};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::ProvisionConfig;
use crate::dialogue::pty::PtyDialogue;
use crate::dialogue::{DialogueDriver, Prompt};
use crate::error::{ProvisionError, Result};
use crate::health::FailureSignature;
use crate::process::{self, CommandLine, ProcessOutput};
use crate::secret::{Pin, PinKind};
use crate::service::SmartcardService;

/// Hidden-input question from ykman, e.g. `Enter Admin PIN: `
const YKMAN_PIN_PROMPT: &str = r"(?im)^[^\n]*(pin|confirmation)[ \t]*:[ \t\r]*$";

/// Smartcard service shelling out to `gpg` and `ykman`
#[derive(Clone, Debug)]
pub struct GpgService {
    gpg: PathBuf,
    ykman: PathBuf,
    gnupg_home: PathBuf,
    timeout: Duration,
}

impl GpgService {
    pub fn new(config: &ProvisionConfig) -> Self {
        Self {
            gpg: config.gpg_binary.clone(),
            ykman: config.ykman_binary.clone(),
            gnupg_home: config.gnupg_home.clone(),
            timeout: config.command_timeout(),
        }
    }

    /// `gpg` with the configured home
    pub fn gpg_command(&self) -> CommandLine {
        CommandLine::new(&self.gpg).env("GNUPGHOME", &self.gnupg_home)
    }

    /// Interactive `--edit-key` session for the key-to-card dialogue
    pub fn edit_key_command(&self, master: &Fingerprint) -> CommandLine {
        self.gpg_command()
            .args(["--pinentry-mode", "loopback", "--expert", "--edit-key", master.as_str()])
    }

    fn batch(&self) -> CommandLine {
        self.gpg_command()
            .args(["--batch", "--yes", "--pinentry-mode", "loopback", "--passphrase", ""])
    }

    fn ykman(&self) -> CommandLine {
        CommandLine::new(&self.ykman).env("GNUPGHOME", &self.gnupg_home)
    }

    /// `ykman openpgp access` for `kind`; the PINs are asked for, never passed
    fn change_pin_command(&self, kind: PinKind) -> CommandLine {
        self.ykman().args(["openpgp", "access", kind.ykman_command()])
    }

    /// `ykman openpgp keys set-touch`; the admin PIN is asked for, never passed
    fn set_touch_command(&self, slot: KeySlot, policy: TouchPolicy) -> CommandLine {
        self.ykman()
            .args(["openpgp", "keys", "set-touch", slot.ykman_name(), policy.ykman_value()])
            .arg("--force")
    }

    /// Detached signature over nothing, made by exactly `signing_key`
    fn sign_test_command(&self, signing_key: &Fingerprint) -> CommandLine {
        self.gpg_command()
            .args(["--batch", "--pinentry-mode", "loopback", "--passphrase-fd", "0"])
            .arg("--local-user")
            .arg(format!("{}!", signing_key))
            .args(["--output", "-", "--detach-sign", "/dev/null"])
    }

    /// Run `cmd` on a pty, answering its hidden PIN questions in order
    ///
    /// ykman reads PINs from the controlling terminal rather than stdin, so
    /// they go through the pty and stay out of the process table. The PINs
    /// still pass through ykman's own memory and the card reader, which is
    /// as far as the host can keep them.
    async fn run_with_pins(&self, cmd: &CommandLine, answers: &[&Pin]) -> Result<ProcessOutput> {
        let prompt = Prompt::new("ykman PIN prompt", YKMAN_PIN_PROMPT)?;
        let mut dialogue = PtyDialogue::spawn(cmd)?;
        for pin in answers {
            match dialogue.expect(&prompt, self.timeout).await {
                Ok(_) => {}
                Err(e @ ProvisionError::DialogueTimeout { .. }) => return Err(e),
                Err(e) => {
                    // Exited early; its own words say why
                    let output = dialogue.finish(self.timeout).await?;
                    return Err(if output.success {
                        e
                    } else {
                        classify_failure(&cmd.label(), &output)
                    });
                }
            }
            dialogue.send_secret(pin.expose()).await?;
        }
        let output = dialogue.finish(self.timeout).await?;
        if output.success {
            return Ok(output);
        }
        Err(classify_failure(&cmd.label(), &output))
    }

    async fn run(&self, cmd: &CommandLine, stdin: Option<&[u8]>) -> Result<ProcessOutput> {
        let output = process::run(cmd, stdin, self.timeout).await?;
        if output.success {
            return Ok(output);
        }
        Err(classify_failure(&cmd.label(), &output))
    }

    /// Find the subkey `fingerprint` under `master` and return its handle
    async fn subkey_handle(&self, master: &Fingerprint, fingerprint: &Fingerprint) -> Result<KeyHandle> {
        let listing = self.list_keys(master, true).await?;
        subkey_from_listing(&listing, fingerprint)
    }

    async fn list_keys(&self, fingerprint: &Fingerprint, secret: bool) -> Result<String> {
        let which = if secret { "--list-secret-keys" } else { "--list-keys" };
        let cmd = self
            .gpg_command()
            .args(["--batch", "--with-colons", "--with-keygrip", "--fixed-list-mode"])
            .args([which, fingerprint.as_str()]);
        Ok(self.run(&cmd, None).await?.stdout)
    }
}

/// Map a failed command to the error class its output suggests
fn classify_failure(label: &str, output: &ProcessOutput) -> ProvisionError {
    let text = output.combined();
    let detail = text.trim();
    if FailureSignature::detect(&text).is_some() {
        return ProvisionError::HardwareCommunication(format!("{}: {}", label, detail));
    }
    let lower = text.to_ascii_lowercase();
    if lower.contains("bad pin") || lower.contains("wrong pin") || lower.contains("pin blocked")
        || lower.contains("invalid pin")
    {
        return ProvisionError::Pin(format!("{}: {}", label, detail));
    }
    ProvisionError::Service(format!(
        "{} exited with {}: {}",
        label,
        output.code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
        detail
    ))
}

/// Fingerprint from a `KEY_CREATED` status line
fn created_fingerprint(status: &str) -> Result<Fingerprint> {
    status
        .lines()
        .filter_map(|line| line.strip_prefix("[GNUPG:] KEY_CREATED "))
        .find_map(|rest| rest.split_whitespace().nth(1))
        .ok_or_else(|| ProvisionError::Service("no KEY_CREATED status from gpg".to_string()))
        .and_then(|fpr| Ok(Fingerprint::parse(fpr)?))
}

/// Primary fingerprint from `IMPORT_OK` status lines
fn imported_fingerprint(status: &str) -> Result<Fingerprint> {
    status
        .lines()
        .filter_map(|line| line.strip_prefix("[GNUPG:] IMPORT_OK "))
        .find_map(|rest| rest.split_whitespace().nth(1))
        .ok_or_else(|| ProvisionError::Precondition("backup contained no importable key".to_string()))
        .and_then(|fpr| Ok(Fingerprint::parse(fpr)?))
}

fn subkey_from_listing(listing: &str, fingerprint: &Fingerprint) -> Result<KeyHandle> {
    let mut index = 0;
    let mut in_sub = false;
    let mut grip = None;
    let mut found: Option<usize> = None;
    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("ssb") | Some("sub") => {
                if found.is_some() {
                    break;
                }
                index += 1;
                in_sub = true;
            }
            Some("fpr") if in_sub && found.is_none() => {
                if fields.get(9).and_then(|v| Fingerprint::parse(v).ok()).as_ref() == Some(fingerprint) {
                    found = Some(index);
                }
            }
            Some("grp") if in_sub && found == Some(index) => {
                grip = fields.get(9).and_then(|v| keyward_core::Keygrip::parse(v).ok());
            }
            _ => {}
        }
    }
    let index = found.ok_or_else(|| {
        ProvisionError::Service(format!("subkey {} missing from key listing", fingerprint))
    })?;
    Ok(KeyHandle {
        fingerprint: fingerprint.clone(),
        keygrip: grip,
        index,
    })
}

#[async_trait]
impl SmartcardService for GpgService {
    async fn reset(&self) -> Result<()> {
        let cmd = self.ykman().args(["openpgp", "reset", "--force"]);
        self.run(&cmd, None).await?;
        info!("OpenPGP applet reset to factory defaults");
        Ok(())
    }

    async fn set_pin(&self, kind: PinKind, current: &Pin, new: &Pin) -> Result<()> {
        // Current, new, then the confirmation
        let cmd = self.change_pin_command(kind);
        self.run_with_pins(&cmd, &[current, new, new]).await.map_err(|e| match e {
            ProvisionError::Service(msg) => ProvisionError::Pin(format!("setting {} failed: {}", kind, msg)),
            other => other,
        })?;
        info!("{} changed", kind);
        Ok(())
    }

    async fn set_touch_policy(
        &self,
        slot: KeySlot,
        policy: TouchPolicy,
        admin_pin: &Pin,
    ) -> Result<()> {
        let cmd = self.set_touch_command(slot, policy);
        self.run_with_pins(&cmd, &[admin_pin]).await.map_err(|e| match e {
            ProvisionError::Pin(msg) => ProvisionError::Pin(format!("admin PIN rejected: {}", msg)),
            other => other,
        })?;
        debug!(%slot, %policy, "touch policy applied");
        Ok(())
    }

    async fn generate_master_key(
        &self,
        user_id: &UserId,
        kind: KeyKind,
        expiry: &str,
    ) -> Result<KeyHandle> {
        let cmd = self
            .batch()
            .args(["--status-fd", "1", "--quick-generate-key"])
            .arg(user_id.to_string())
            .args([kind.master_algo(), "cert", expiry]);
        let output = self.run(&cmd, None).await?;
        let fingerprint = created_fingerprint(&output.stdout)?;
        let identity = self.describe_key(&fingerprint).await?;
        info!(fingerprint = %fingerprint, "Master key generated");
        Ok(identity.master)
    }

    async fn add_subkey(
        &self,
        master: &Fingerprint,
        kind: KeyKind,
        usage: KeyUsage,
        expiry: &str,
    ) -> Result<KeyHandle> {
        let cmd = self
            .batch()
            .args(["--status-fd", "1", "--quick-add-key", master.as_str()])
            .args([kind.subkey_algo(usage), usage.gpg_usage(), expiry]);
        let output = self.run(&cmd, None).await?;
        let fingerprint = created_fingerprint(&output.stdout)?;
        let handle = self.subkey_handle(master, &fingerprint).await?;
        info!(fingerprint = %fingerprint, usage = usage.gpg_usage(), "Subkey added");
        Ok(handle)
    }

    async fn import_key(&self, blob: &[u8]) -> Result<Fingerprint> {
        let cmd = self.batch().args(["--status-fd", "1", "--import"]);
        let output = self.run(&cmd, Some(blob)).await?;
        imported_fingerprint(&output.stdout)
    }

    async fn describe_key(&self, fingerprint: &Fingerprint) -> Result<KeyIdentity> {
        // After a transfer the master may survive only as a public key
        let listing = match self.list_keys(fingerprint, true).await {
            Ok(listing) if !listing.trim().is_empty() => listing,
            _ => self.list_keys(fingerprint, false).await?,
        };
        Ok(KeyIdentity::from_colon_listing(&listing)?)
    }

    async fn card_status(&self) -> Result<String> {
        // Failure text is part of the status; callers classify it
        let cmd = self.gpg_command().arg("--card-status");
        let output = process::run(&cmd, None, self.timeout).await?;
        Ok(output.combined())
    }

    async fn export_public(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let cmd = self.gpg_command().args(["--armor", "--export", fingerprint.as_str()]);
        Ok(self.run(&cmd, None).await?.stdout.into_bytes())
    }

    async fn export_secret_subkeys(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let cmd = self
            .batch()
            .args(["--armor", "--export-secret-subkeys", fingerprint.as_str()]);
        Ok(self.run(&cmd, None).await?.stdout.into_bytes())
    }

    async fn export_ssh(&self, fingerprint: &Fingerprint) -> Result<String> {
        let cmd = self.gpg_command().args(["--export-ssh-key", fingerprint.as_str()]);
        Ok(self.run(&cmd, None).await?.stdout)
    }

    async fn sign_test(&self, signing_key: &Fingerprint, user_pin: &Pin) -> Result<bool> {
        let mut input = Zeroizing::new(user_pin.expose().as_bytes().to_vec());
        input.push(b'\n');
        let cmd = self.sign_test_command(signing_key);
        let output = process::run(&cmd, Some(&input), self.timeout).await?;
        if !output.success {
            debug!(code = ?output.code, "test signature refused");
        }
        Ok(output.success)
    }
}
