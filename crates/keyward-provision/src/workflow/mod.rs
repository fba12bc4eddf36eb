//! Mode controller
//!
//! Runs one of the three workflows as an ordered list of steps:
//!
//! | Mode     | Steps |
//! |----------|-------|
//! | Generate | detect, confirm reset, initialize, generate, transfer, verify, post-config, backup |
//! | Load     | detect, open backup, confirm reset, initialize, import, transfer, verify, post-config, backup |
//! | Backup   | detect, resolve identity, verify, backup |
//!
//! The first failing step ends the run. PINs exist only between
//! `initialize` and the end of `post_config`.

pub mod state;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keyward_core::{
    Device, KeyIdentity, KeyKind, KeySlot, Redactor, TouchPolicy, UserId, VerificationResult,
    VerifiedTransfer,
};
use tracing::{error, info, warn};

use crate::backup::{BackupBuilder, BackupBundle, BackupOutcome, SubkeySnapshot};
use crate::config::ProvisionConfig;
use crate::dialogue::{DialogueFactory, PtyDialogueFactory};
use crate::error::{ErrorClass, ProvisionError, Result};
use crate::gpg::GpgService;
use crate::health::{FailureSignature, GpgAgentMediator, HealthManager, Mediator};
use crate::prompt::{collect_new_pin, Operator, TerminalOperator};
use crate::secret::{Pin, PinKind, PinPair};
use crate::service::SmartcardService;
use crate::transfer::SessionDriver;
use crate::verify::TransferVerifier;

pub use state::{is_legal, Stage, StateMachine, WorkflowState};

/// Workflow selected by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Generate,
    Load,
    Backup,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Generate => "generate",
            Mode::Load => "load",
            Mode::Backup => "backup",
        })
    }
}

/// Inputs of a workflow run
#[derive(Debug, Clone)]
pub enum ModeParams {
    Generate {
        user_id: UserId,
        key_kind: KeyKind,
        touch_policy: TouchPolicy,
        expiry: String,
    },
    Load {
        backup: PathBuf,
    },
    Backup,
}

impl ModeParams {
    pub fn mode(&self) -> Mode {
        match self {
            ModeParams::Generate { .. } => Mode::Generate,
            ModeParams::Load { .. } => Mode::Load,
            ModeParams::Backup => Mode::Backup,
        }
    }
}

/// Outcome of a workflow run
#[derive(Debug)]
pub struct WorkflowResult {
    pub mode: Mode,
    pub state: WorkflowState,
    pub history: Vec<Stage>,
    pub device: Option<Device>,
    pub identity: Option<KeyIdentity>,
    pub verification: Option<VerificationResult>,
    pub backup: Option<BackupOutcome>,
    pub error: Option<ProvisionError>,
}

impl WorkflowResult {
    pub fn succeeded(&self) -> bool {
        self.state == WorkflowState::Active(Stage::Done)
    }

    /// Process exit status for this outcome
    ///
    /// 0 success or cancel, 2 precondition, 3 verification failure, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.state {
            WorkflowState::Active(Stage::Done) | WorkflowState::Cancelled { .. } => 0,
            WorkflowState::Failed { .. } => match self.error.as_ref().map(ProvisionError::class) {
                Some(ErrorClass::Precondition) => 2,
                Some(ErrorClass::Structural) => 3,
                _ => 1,
            },
            WorkflowState::Active(_) => 1,
        }
    }

    /// Operator-facing block describing a failed run
    pub fn diagnostic(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        if let WorkflowState::Cancelled { stage } = self.state {
            return Some(format!("{} cancelled during {}; nothing further was changed", self.mode, stage));
        }

        let mut out = format!("=== keyward {}: {} ===\n", self.mode, self.state);
        out.push_str(&format!("error: {}\n", error));
        if let Some(report) = error.report() {
            out.push('\n');
            out.push_str(report);
            if !report.ends_with('\n') {
                out.push('\n');
            }
        }
        if let Some(hint) = remediation(error.class()) {
            out.push_str(&format!("next step: {}\n", hint));
        }
        Some(out)
    }
}

fn remediation(class: ErrorClass) -> Option<&'static str> {
    match class {
        ErrorClass::Precondition => Some(
            "insert the token and make sure gpg, gpgconf, gpg-connect-agent and ykman are installed",
        ),
        ErrorClass::Communication => {
            Some("re-insert the token, run `keyward restart-agent`, then start again")
        }
        ErrorClass::Structural => Some(
            "no backup was written; private key material may still be on this host, inspect the report before retrying",
        ),
        ErrorClass::Pin => Some(
            "the token may be half-configured; `ykman openpgp reset` restores factory state",
        ),
        ErrorClass::Timeout => Some("touch the token when it blinks, then start again"),
        ErrorClass::Archive => {
            Some("the keys are on the token; run `keyward backup` to write the backup again")
        }
        ErrorClass::Cancelled | ErrorClass::Other => None,
    }
}

/// External collaborators of a workflow
#[derive(Clone)]
pub struct Collaborators {
    pub service: Arc<dyn SmartcardService>,
    pub mediator: Arc<dyn Mediator>,
    pub dialogues: Arc<dyn DialogueFactory>,
    pub operator: Arc<dyn Operator>,
}

impl Collaborators {
    /// GnuPG, ykman, a pty dialogue and the terminal
    pub fn system(config: &ProvisionConfig, assume_yes: bool) -> Self {
        let gpg = GpgService::new(config);
        Self {
            service: Arc::new(gpg.clone()),
            mediator: Arc::new(GpgAgentMediator::new(config)),
            dialogues: Arc::new(PtyDialogueFactory::new(gpg)),
            operator: Arc::new(TerminalOperator::new(assume_yes)),
        }
    }
}

/// Facts gathered while a run progresses
#[derive(Default)]
struct Run {
    machine: StateMachine,
    device: Option<Device>,
    identity: Option<KeyIdentity>,
    backup: Option<BackupOutcome>,
}

/// The mode controller
pub struct Workflow {
    service: Arc<dyn SmartcardService>,
    operator: Arc<dyn Operator>,
    health: HealthManager,
    driver: SessionDriver,
    verifier: TransferVerifier,
    backups: BackupBuilder,
    redactor: Redactor,
    transfer_timeout: Duration,
    default_touch: TouchPolicy,
}

impl Workflow {
    pub fn new(
        config: &ProvisionConfig,
        collaborators: Collaborators,
        redactor: Redactor,
    ) -> Result<Self> {
        let Collaborators {
            service,
            mediator,
            dialogues,
            operator,
        } = collaborators;
        let health = HealthManager::new(mediator, config.retry.clone(), config.mediator_settle());
        Ok(Self {
            driver: SessionDriver::new(dialogues, health.clone())?,
            verifier: TransferVerifier::new(
                service.clone(),
                health.clone(),
                config.private_keys_dir(),
                config.stub_size_threshold,
            ),
            backups: BackupBuilder::new(service.clone(), config.backup_dir.clone()),
            service,
            operator,
            health,
            redactor,
            transfer_timeout: config.transfer_timeout(),
            default_touch: config.touch_policy,
        })
    }

    pub fn health(&self) -> &HealthManager {
        &self.health
    }

    /// Run a workflow to a terminal state
    pub async fn run(&self, params: ModeParams) -> WorkflowResult {
        let mode = params.mode();
        info!(%mode, "Workflow started");
        let mut run = Run::default();

        let outcome = match params {
            ModeParams::Generate {
                user_id,
                key_kind,
                touch_policy,
                expiry,
            } => {
                self.generate(&mut run, &user_id, key_kind, touch_policy, &expiry)
                    .await
            }
            ModeParams::Load { backup } => self.load(&mut run, backup).await,
            ModeParams::Backup => self.backup_only(&mut run).await,
        };

        let error = match outcome {
            Ok(()) => {
                info!(%mode, "Workflow finished");
                None
            }
            Err(ProvisionError::Cancelled) => {
                run.machine.cancel();
                warn!(%mode, state = %run.machine.state(), "Workflow cancelled");
                Some(ProvisionError::Cancelled)
            }
            Err(e) => {
                run.machine.fail();
                error!(%mode, state = %run.machine.state(), "Workflow failed: {}", e);
                Some(e)
            }
        };

        WorkflowResult {
            mode,
            state: run.machine.state(),
            history: run.machine.history().to_vec(),
            verification: run.machine.verification().cloned(),
            device: run.device,
            identity: run.identity,
            backup: run.backup,
            error,
        }
    }

    async fn generate(
        &self,
        run: &mut Run,
        user_id: &UserId,
        key_kind: KeyKind,
        touch_policy: TouchPolicy,
        expiry: &str,
    ) -> Result<()> {
        let device = self.detect().await?;
        run.machine.advance(Stage::DeviceDetected)?;
        self.confirm_reset(&device).await?;
        run.device = Some(device);

        let pins = self.initialize(touch_policy).await?;
        run.machine.advance(Stage::Initialized)?;

        let (identity, snapshot) = self.generate_material(user_id, key_kind, expiry).await?;
        run.identity = Some(identity.clone());
        run.machine.advance(Stage::MaterialReady)?;

        let verified = self.transfer_and_verify(run, &identity, &pins).await?;
        self.post_config(run, &identity, pins).await?;
        self.write_backup(run, &identity, &verified, Some(&snapshot)).await
    }

    async fn load(&self, run: &mut Run, backup: PathBuf) -> Result<()> {
        let device = self.detect().await?;
        run.machine.advance(Stage::DeviceDetected)?;

        let bundle = BackupBundle::open(&backup)?;
        bundle.snapshot()?;
        self.confirm_reset(&device).await?;
        run.device = Some(device);

        let pins = self.initialize(self.default_touch).await?;
        run.machine.advance(Stage::Initialized)?;

        let identity = self.import_material(&bundle).await?;
        run.identity = Some(identity.clone());
        run.machine.advance(Stage::MaterialReady)?;

        let verified = self.transfer_and_verify(run, &identity, &pins).await?;
        self.post_config(run, &identity, pins).await?;
        self.write_backup(run, &identity, &verified, bundle.snapshot().ok())
            .await
    }

    async fn backup_only(&self, run: &mut Run) -> Result<()> {
        let device = self.detect().await?;
        run.machine.advance(Stage::DeviceDetected)?;

        let identity = self.resolve_identity(&device).await?;
        run.device = Some(device);
        run.identity = Some(identity.clone());
        run.machine.advance(Stage::MaterialReady)?;

        run.machine.advance(Stage::Verifying)?;
        let verified = self.verifier.verify(Some(&identity)).await?;
        run.machine.record_verification(&verified);
        run.machine.advance(Stage::Verified)?;

        self.write_backup(run, &identity, &verified, None).await
    }

    /// Find the token and read its status
    ///
    /// A mediator that cannot reach any card is reported as a missing token.
    pub async fn detect(&self) -> Result<Device> {
        self.health.ensure_healthy().await.map_err(|e| match e {
            ProvisionError::HardwareCommunication(detail) => {
                ProvisionError::Precondition(format!("no token detected: {}", detail))
            }
            other => other,
        })?;
        let (device, _) = self.read_device().await?;
        info!("Token detected: {}", device.summary());
        Ok(device)
    }

    /// Current device and the raw status it was parsed from
    pub async fn read_device(&self) -> Result<(Device, String)> {
        let status = self.service.card_status().await?;
        if let Some(signature) = FailureSignature::detect(&status) {
            return Err(ProvisionError::Precondition(format!(
                "no token detected: card status reports '{}'",
                signature
            )));
        }
        let device = Device::from_card_status(&status).map_err(|e| {
            ProvisionError::Precondition(format!("no usable token: {}", e))
        })?;
        Ok((device, status))
    }

    async fn confirm_reset(&self, device: &Device) -> Result<()> {
        let occupied: Vec<String> = device
            .slots
            .iter()
            .filter(|(_, state)| state.is_occupied())
            .map(|(slot, _)| slot.to_string())
            .collect();
        let question = if occupied.is_empty() {
            format!("Reset the OpenPGP applet of token {}?", device.serial)
        } else {
            format!(
                "Token {} holds keys in the {} slot(s). Reset it and destroy them?",
                device.serial,
                occupied.join(", ")
            )
        };
        if self.operator.confirm(&question).await? {
            Ok(())
        } else {
            Err(ProvisionError::Cancelled)
        }
    }

    /// Reset the applet, set both PINs and the touch policy
    ///
    /// The returned PINs are the only copies; they are dropped after
    /// post-configuration.
    async fn initialize(&self, touch_policy: TouchPolicy) -> Result<PinPair> {
        let operator = self.operator.as_ref();
        let user = collect_new_pin(operator, PinKind::User, &self.redactor).await?;
        let admin = collect_new_pin(operator, PinKind::Admin, &self.redactor).await?;

        info!("Resetting OpenPGP applet");
        self.service.reset().await?;
        // A reset leaves scdaemon holding a stale handle more often than not
        self.health.ensure_healthy().await?;

        let factory_admin = Pin::factory(PinKind::Admin, &self.redactor);
        self.service
            .set_pin(PinKind::Admin, &factory_admin, &admin)
            .await?;
        let factory_user = Pin::factory(PinKind::User, &self.redactor);
        self.service
            .set_pin(PinKind::User, &factory_user, &user)
            .await?;
        info!("User and admin PINs set");

        for slot in KeySlot::ALL {
            self.service
                .set_touch_policy(slot, touch_policy, &admin)
                .await?;
        }
        info!("Touch policy {} applied to all slots", touch_policy);

        let (device, _) = self.read_device().await?;
        if let Some(retries) = device.pin_retries {
            info!(
                user = retries.user,
                admin = retries.admin,
                "PIN retry counters after initialization"
            );
        }
        Ok(PinPair { user, admin })
    }

    /// Create the master key and three subkeys, then snapshot the subkeys
    async fn generate_material(
        &self,
        user_id: &UserId,
        kind: KeyKind,
        expiry: &str,
    ) -> Result<(KeyIdentity, SubkeySnapshot)> {
        info!("Generating {} master key for {}", kind, user_id);
        let master = self.service.generate_master_key(user_id, kind, expiry).await?;
        for slot in KeySlot::ALL {
            self.service
                .add_subkey(&master.fingerprint, kind, slot.usage(), expiry)
                .await?;
        }
        let identity = self.service.describe_key(&master.fingerprint).await?;
        let snapshot =
            SubkeySnapshot::new(self.service.export_secret_subkeys(&master.fingerprint).await?);
        info!(
            master = %identity.master.fingerprint,
            "Key material ready"
        );
        Ok((identity, snapshot))
    }

    /// Import a backup's public key and subkeys and check they match its manifest
    async fn import_material(&self, bundle: &BackupBundle) -> Result<KeyIdentity> {
        let expected = &bundle.manifest.master_fingerprint;
        let public = self.service.import_key(bundle.public_key()).await?;
        let secret = self.service.import_key(bundle.snapshot()?.as_bytes()).await?;
        if public != *expected || secret != *expected {
            return Err(ProvisionError::Precondition(format!(
                "backup manifest names {} but its files hold {}",
                expected, secret
            )));
        }

        let identity = self.service.describe_key(expected).await?;
        for (slot, handle) in identity.subkeys() {
            if bundle.manifest.subkey_fingerprints.get(&slot) != Some(&handle.fingerprint) {
                return Err(ProvisionError::Precondition(format!(
                    "imported {} subkey {} is not the one in the manifest",
                    slot,
                    handle.fingerprint.short()
                )));
            }
        }
        info!(master = %identity.master.fingerprint, "Backup material imported");
        Ok(identity)
    }

    /// Identity of the keys already on the token
    async fn resolve_identity(&self, device: &Device) -> Result<KeyIdentity> {
        let fingerprint = device
            .slots
            .iter()
            .find_map(|(_, state)| state.fingerprint())
            .ok_or_else(|| {
                ProvisionError::Precondition(format!(
                    "token {} holds no keys to back up",
                    device.serial
                ))
            })?;
        self.service.describe_key(&fingerprint).await
    }

    async fn transfer_and_verify(
        &self,
        run: &mut Run,
        identity: &KeyIdentity,
        pins: &PinPair,
    ) -> Result<VerifiedTransfer> {
        self.health.ensure_healthy().await?;
        run.machine.advance(Stage::Transferring)?;
        self.operator
            .notify("Moving subkeys to the token. Touch it if it starts blinking.");
        let session = self
            .driver
            .transfer(identity, &KeySlot::ALL, &pins.admin, self.transfer_timeout)
            .await?;
        info!(
            attempts = session.attempts,
            restarts = session.restarts,
            "Subkeys handed to the token"
        );

        run.machine.advance(Stage::Verifying)?;
        let verified = self.verifier.verify(Some(identity)).await?;
        run.machine.record_verification(&verified);
        run.machine.advance(Stage::Verified)?;
        Ok(verified)
    }

    /// Prove the new user PIN works by signing with the transferred signing key
    async fn post_config(
        &self,
        run: &mut Run,
        identity: &KeyIdentity,
        pins: PinPair,
    ) -> Result<()> {
        run.machine.advance(Stage::PostConfig)?;
        self.operator
            .notify("Checking the token signs with the new user PIN. Touch it if it blinks.");
        let signing_key = &identity.signing.fingerprint;
        if !self.service.sign_test(signing_key, &pins.user).await? {
            return Err(ProvisionError::Pin(
                "token refused a test signature with the new user PIN".to_string(),
            ));
        }
        drop(pins);
        info!("Test signature succeeded");
        Ok(())
    }

    async fn write_backup(
        &self,
        run: &mut Run,
        identity: &KeyIdentity,
        verified: &VerifiedTransfer,
        snapshot: Option<&SubkeySnapshot>,
    ) -> Result<()> {
        run.machine.begin_backup()?;
        let outcome = self.backups.build(identity, verified, snapshot).await?;
        self.operator
            .notify(&format!("Backup written to {}", outcome.dir.display()));
        run.backup = Some(outcome);
        run.machine.advance(Stage::BackedUp)?;
        run.machine.advance(Stage::Done)
    }
}
