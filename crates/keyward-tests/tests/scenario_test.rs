//! Provisioning scenarios run end to end against scripted collaborators
//!
//! Each test drives the real mode controller, session driver, verifier and
//! backup builder. Only the card service, mediator, key editor dialogue and
//! operator are fakes.

use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keyward_core::{KeyKind, KeySlot, Redactor, RetryPolicy, TouchPolicy, UserId, REDACTED};
use keyward_provision::logging::RedactingMakeWriter;
use keyward_provision::testing::{
    sample_identity, shadowed_stub, write_sample_stubs, FakeCard, FakeMediator,
    ScriptedDialogueFactory, ScriptedOperator, ScriptedStep, EMPTY_STATUS, LOADED_STATUS,
    UNSHADOWED_ED25519_KEY,
};
use keyward_provision::{
    Collaborators, HealthManager, ModeParams, ProvisionConfig, ProvisionError, Stage,
    TransferVerifier, Workflow, WorkflowResult, WorkflowState,
};
use tempfile::{tempdir, TempDir};

const USER_PIN: &str = "135798";
const ADMIN_PIN: &str = "13579864";

// ============================================
// Harness
// ============================================

struct Bench {
    dir: TempDir,
    config: ProvisionConfig,
    card: Arc<FakeCard>,
    mediator: Arc<FakeMediator>,
    dialogues: Arc<ScriptedDialogueFactory>,
    redactor: Redactor,
}

impl Bench {
    fn new(card: FakeCard, steps: Vec<ScriptedStep>) -> Self {
        let dir = tempdir().unwrap();
        let config = ProvisionConfig {
            gnupg_home: dir.path().join("gnupg"),
            backup_dir: dir.path().join("backups"),
            log_dir: dir.path().join("logs"),
            retry: RetryPolicy::immediate(3),
            mediator_settle_ms: 0,
            ..ProvisionConfig::default()
        };
        write_sample_stubs(&config.private_keys_dir(), 300).unwrap();
        let card = Arc::new(card);
        let dialogues = Arc::new(ScriptedDialogueFactory::new(steps).with_card(card.clone()));
        Self {
            dir,
            config,
            card,
            mediator: Arc::new(FakeMediator::healthy()),
            dialogues,
            redactor: Redactor::new(),
        }
    }

    fn with_mediator(mut self, mediator: FakeMediator) -> Self {
        self.mediator = Arc::new(mediator);
        self
    }

    async fn run(&self, params: ModeParams, operator: ScriptedOperator) -> WorkflowResult {
        let collaborators = Collaborators {
            service: self.card.clone(),
            mediator: self.mediator.clone(),
            dialogues: self.dialogues.clone(),
            operator: Arc::new(operator),
        };
        Workflow::new(&self.config, collaborators, self.redactor.clone())
            .unwrap()
            .run(params)
            .await
    }

    fn backups(&self) -> usize {
        match std::fs::read_dir(&self.config.backup_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

fn happy_steps() -> Vec<ScriptedStep> {
    KeySlot::ALL
        .into_iter()
        .map(ScriptedStep::happy_transfer)
        .collect()
}

fn generate() -> ModeParams {
    ModeParams::Generate {
        user_id: UserId::new("Jane Doe", "jane@example.com").unwrap(),
        key_kind: KeyKind::Ed25519,
        touch_policy: TouchPolicy::On,
        expiry: "2y".to_string(),
    }
}

fn operator() -> ScriptedOperator {
    ScriptedOperator::provisioning(USER_PIN, ADMIN_PIN)
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn files_containing(dir: &Path, needle: &str) -> Vec<String> {
    let mut hits = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return hits;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            hits.extend(files_containing(&path, needle));
        } else if let Ok(data) = std::fs::read(&path) {
            if String::from_utf8_lossy(&data).contains(needle) {
                hits.push(path.display().to_string());
            }
        }
    }
    hits
}

// ============================================
// Scenarios
// ============================================

#[tokio::test]
async fn test_generate_happy_path_backs_up_once() {
    let bench = Bench::new(FakeCard::new(), happy_steps());
    let result = bench.run(generate(), operator()).await;

    assert_eq!(result.state, WorkflowState::Active(Stage::Done), "{:?}", result.error);
    assert_eq!(result.exit_code(), 0);
    assert_eq!(bench.backups(), 1);
    assert_eq!(bench.card.call_count("export-public"), 1);
    assert_eq!(bench.dialogues.opened(), 3);

    let verification = result.verification.unwrap();
    assert!(verification.is_fully_positive());
    assert_eq!(verification.retries, 0);
}

#[tokio::test]
async fn test_touch_timeout_fails_without_backup() {
    let bench = Bench::new(FakeCard::new(), vec![ScriptedStep::touch_never_given()]);
    let result = bench.run(generate(), operator()).await;

    assert!(matches!(
        result.error,
        Some(ProvisionError::DialogueTimeout { .. })
    ));
    assert_eq!(
        result.state,
        WorkflowState::Failed {
            stage: Stage::Transferring,
            backup_attempted: false
        }
    );
    assert_eq!(result.exit_code(), 1);
    assert_eq!(bench.backups(), 0);
    assert_eq!(bench.mediator.restarts(), 0);
}

#[tokio::test]
async fn test_transient_status_flake_is_absorbed() {
    let card = FakeCard::new();
    card.flake_once_loaded("gpg: selecting card failed: Card error");
    let bench = Bench::new(card, happy_steps());
    let result = bench.run(generate(), operator()).await;

    assert_eq!(result.state, WorkflowState::Active(Stage::Done), "{:?}", result.error);
    let verification = result.verification.unwrap();
    assert!(verification.is_fully_positive());
    assert_eq!(verification.retries, 1);
    assert_eq!(bench.mediator.restarts(), 1);
    assert_eq!(bench.backups(), 1);
}

#[tokio::test]
async fn test_verifier_flake_retried_once() {
    let dir = tempdir().unwrap();
    write_sample_stubs(dir.path(), 300).unwrap();
    let card = Arc::new(FakeCard::with_status(LOADED_STATUS));
    card.push_status_failures(["gpg: selecting card failed: Broken pipe"]);
    let mediator = Arc::new(FakeMediator::healthy());
    let health = HealthManager::new(mediator.clone(), RetryPolicy::immediate(3), Duration::ZERO);
    let verifier = TransferVerifier::new(card, health, dir.path().to_path_buf(), 1024);

    let result = verifier.check(Some(&sample_identity())).await.unwrap();
    assert!(result.is_fully_positive());
    assert_eq!(result.retries, 1);
    assert_eq!(mediator.restarts(), 1);
}

#[tokio::test]
async fn test_persistent_card_error_stops_after_three_restarts() {
    let steps = (0..4).map(|_| ScriptedStep::card_error()).collect();
    let bench = Bench::new(FakeCard::new(), steps);
    let result = bench.run(generate(), operator()).await;

    assert!(matches!(
        result.error,
        Some(ProvisionError::HardwareCommunication(_))
    ));
    assert_eq!(bench.mediator.restarts(), 3);
    assert_eq!(bench.dialogues.opened(), 4);
    assert_eq!(bench.backups(), 0);
}

#[tokio::test]
async fn test_unhealthy_mediator_restarts_exactly_three_times() {
    let bench =
        Bench::new(FakeCard::new(), happy_steps()).with_mediator(FakeMediator::always_failing());
    let result = bench.run(generate(), operator()).await;

    assert_eq!(bench.mediator.restarts(), 3);
    assert_eq!(result.exit_code(), 2);
    assert_eq!(bench.card.call_count("reset"), 0);
}

#[tokio::test]
async fn test_pin_never_reaches_logs_or_files() {
    let capture = Capture::default();
    let bench = Bench::new(
        FakeCard::new(),
        vec![
            ScriptedStep::happy_transfer(KeySlot::Signature),
            ScriptedStep::echoing_pin(ADMIN_PIN),
        ],
    );
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(RedactingMakeWriter::new(
            {
                let capture = capture.clone();
                move || capture.clone()
            },
            bench.redactor.clone(),
        ))
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let result = bench.run(generate(), operator()).await;
    assert!(result.error.is_some());

    let log = capture.text();
    assert!(!log.is_empty());
    assert!(!log.contains(USER_PIN), "user PIN leaked:\n{}", log);
    assert!(!log.contains(ADMIN_PIN), "admin PIN leaked:\n{}", log);
    assert!(log.contains(REDACTED));

    let diagnostic = result.diagnostic().unwrap();
    assert!(!diagnostic.contains(ADMIN_PIN));
    assert!(files_containing(bench.dir.path(), USER_PIN).is_empty());
    assert!(files_containing(bench.dir.path(), ADMIN_PIN).is_empty());
}

#[tokio::test]
async fn test_empty_signature_slot_is_flagged() {
    let dir = tempdir().unwrap();
    let status = LOADED_STATUS.replace(
        "Signature key ....: 1111 1111 1111 1111 1111  1111 1111 1111 1111 1111",
        "Signature key ....: [none]",
    );
    let card = Arc::new(FakeCard::with_status(&status));
    let health = HealthManager::new(
        Arc::new(FakeMediator::healthy()),
        RetryPolicy::immediate(3),
        Duration::ZERO,
    );
    let verifier = TransferVerifier::new(card, health, dir.path().to_path_buf(), 1024);

    let result = verifier.check(Some(&sample_identity())).await.unwrap();
    assert!(!result.is_fully_positive());
    assert_eq!(result.missing_slots(), vec![KeySlot::Signature]);

    let err = verifier.verify(Some(&sample_identity())).await.unwrap_err();
    assert!(matches!(err, ProvisionError::TransferStructural { .. }));
}

#[tokio::test]
async fn test_oversized_stub_with_full_slots_is_negative() {
    let dir = tempdir().unwrap();
    write_sample_stubs(dir.path(), 300).unwrap();
    let grip = sample_identity().encryption.keygrip.unwrap();
    std::fs::write(dir.path().join(grip.file_name()), shadowed_stub(2048)).unwrap();

    let card = Arc::new(FakeCard::with_status(LOADED_STATUS));
    let mediator = Arc::new(FakeMediator::healthy());
    let health = HealthManager::new(mediator.clone(), RetryPolicy::immediate(3), Duration::ZERO);
    let verifier = TransferVerifier::new(card, health, dir.path().to_path_buf(), 1024);

    let result = verifier.check(Some(&sample_identity())).await.unwrap();
    assert!(result.missing_slots().is_empty());
    assert_eq!(result.leftover_keys().len(), 1);
    assert_eq!(result.leftover_keys()[0].size, 2048);
    assert!(!result.is_fully_positive());
    assert_eq!(mediator.restarts(), 0);
}

#[tokio::test]
async fn test_small_plain_key_with_full_slots_is_negative() {
    let dir = tempdir().unwrap();
    write_sample_stubs(dir.path(), 300).unwrap();
    let grip = sample_identity().authentication.keygrip.unwrap();
    std::fs::write(dir.path().join(grip.file_name()), UNSHADOWED_ED25519_KEY).unwrap();

    let card = Arc::new(FakeCard::with_status(LOADED_STATUS));
    let mediator = Arc::new(FakeMediator::healthy());
    let health = HealthManager::new(mediator.clone(), RetryPolicy::immediate(3), Duration::ZERO);
    let verifier = TransferVerifier::new(card, health, dir.path().to_path_buf(), 1024);

    let result = verifier.check(Some(&sample_identity())).await.unwrap();
    assert!(result.missing_slots().is_empty());
    assert!(result.stub_files.iter().all(|f| f.size <= 1024));
    assert_eq!(result.leftover_keys().len(), 1);
    assert!(!result.is_fully_positive());

    let err = verifier.verify(Some(&sample_identity())).await.unwrap_err();
    assert!(matches!(err, ProvisionError::TransferStructural { .. }));
}

#[tokio::test]
async fn test_empty_token_cannot_be_backed_up() {
    let bench = Bench::new(FakeCard::with_status(EMPTY_STATUS), Vec::new());
    let result = bench.run(ModeParams::Backup, ScriptedOperator::new()).await;

    assert_eq!(result.exit_code(), 2);
    assert_eq!(bench.backups(), 0);
}

#[tokio::test]
async fn test_generate_then_load_onto_second_token() {
    let first = Bench::new(FakeCard::new(), happy_steps());
    let generated = first.run(generate(), operator()).await;
    let backup = generated.backup.expect("first run writes a backup");

    let second = Bench::new(FakeCard::new(), happy_steps());
    let loaded = second
        .run(
            ModeParams::Load {
                backup: backup.dir.clone(),
            },
            operator(),
        )
        .await;

    assert_eq!(loaded.exit_code(), 0, "{:?}", loaded.error);
    assert_eq!(
        loaded.identity.unwrap().master.fingerprint,
        backup.manifest.master_fingerprint
    );
    assert_eq!(second.backups(), 1);
}
