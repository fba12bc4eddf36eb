//! Backup gating property
//!
//! For any combination of slot occupancy and host key files, a backup is
//! written exactly when verification is fully positive.

use std::sync::Arc;

use keyward_core::{KeySlot, Redactor, RetryPolicy, DEFAULT_STUB_THRESHOLD};
use keyward_provision::testing::{
    sample_identity, shadowed_stub, FakeCard, FakeMediator, ScriptedDialogueFactory,
    ScriptedOperator, UNSHADOWED_ED25519_KEY,
};
use keyward_provision::{
    Collaborators, ModeParams, ProvisionConfig, Workflow, WorkflowResult, WorkflowState,
};
use proptest::prelude::*;
use tempfile::tempdir;

#[derive(Debug, Clone, Copy)]
enum KeyFile {
    Stub(usize),
    Unshadowed,
}

impl KeyFile {
    fn is_card_stub(self) -> bool {
        matches!(self, KeyFile::Stub(size) if size as u64 <= DEFAULT_STUB_THRESHOLD)
    }

    fn contents(self) -> Vec<u8> {
        match self {
            KeyFile::Stub(size) => shadowed_stub(size),
            KeyFile::Unshadowed => UNSHADOWED_ED25519_KEY.to_vec(),
        }
    }
}

fn key_file() -> impl Strategy<Value = KeyFile> {
    prop_oneof![
        (200usize..=DEFAULT_STUB_THRESHOLD as usize).prop_map(KeyFile::Stub),
        (1025usize..8192).prop_map(KeyFile::Stub),
        Just(KeyFile::Unshadowed),
    ]
}

struct Outcome {
    result: WorkflowResult,
    backups_on_disk: usize,
    exports: usize,
}

fn run_backup_mode(present: [bool; 3], files: [KeyFile; 3]) -> Outcome {
    let dir = tempdir().unwrap();
    let config = ProvisionConfig {
        gnupg_home: dir.path().join("gnupg"),
        backup_dir: dir.path().join("backups"),
        log_dir: dir.path().join("logs"),
        retry: RetryPolicy::immediate(3),
        mediator_settle_ms: 0,
        ..ProvisionConfig::default()
    };

    let keys = config.private_keys_dir();
    std::fs::create_dir_all(&keys).unwrap();
    for ((_, handle), file) in sample_identity().subkeys().zip(files) {
        let grip = handle.keygrip.as_ref().unwrap();
        std::fs::write(keys.join(grip.file_name()), file.contents()).unwrap();
    }

    let card = Arc::new(FakeCard::new());
    for (slot, loaded) in KeySlot::ALL.into_iter().zip(present) {
        if loaded {
            card.load_slot(slot);
        }
    }

    let collaborators = Collaborators {
        service: card.clone(),
        mediator: Arc::new(FakeMediator::healthy()),
        dialogues: Arc::new(ScriptedDialogueFactory::new(Vec::new())),
        operator: Arc::new(ScriptedOperator::new()),
    };
    let workflow = Workflow::new(&config, collaborators, Redactor::new()).unwrap();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let result = runtime.block_on(workflow.run(ModeParams::Backup));

    let backups_on_disk = std::fs::read_dir(&config.backup_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    Outcome {
        result,
        backups_on_disk,
        exports: card.call_count("export-public"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn backup_written_iff_fully_positive(
        present in prop::array::uniform3(any::<bool>()),
        files in prop::array::uniform3(key_file()),
    ) {
        let positive = present.iter().all(|p| *p)
            && files.iter().all(|f| f.is_card_stub());

        let outcome = run_backup_mode(present, files);

        prop_assert_eq!(outcome.result.backup.is_some(), positive);
        prop_assert_eq!(outcome.backups_on_disk, usize::from(positive));
        prop_assert_eq!(outcome.exports, usize::from(positive));
        if positive {
            prop_assert_eq!(outcome.result.exit_code(), 0);
        } else if present.iter().any(|p| *p) {
            prop_assert_eq!(outcome.result.exit_code(), 3);
        } else {
            prop_assert_eq!(outcome.result.exit_code(), 2);
        }
    }

    #[test]
    fn failed_verification_never_marks_backup_attempted(
        missing in 0usize..3,
    ) {
        let mut present = [true; 3];
        present[missing] = false;
        let outcome = run_backup_mode(present, [KeyFile::Stub(300); 3]);

        match outcome.result.state {
            WorkflowState::Failed { backup_attempted, .. } => {
                prop_assert!(!backup_attempted);
            }
            other => prop_assert!(false, "unexpected state {:?}", other),
        }
    }
}
