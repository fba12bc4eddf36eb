//! Key-to-card transfer
//!
//! Each subkey moves in its own `--edit-key` dialogue:
//!
//! ```text
//! gpg> key N
//! gpg> keytocard
//! Your selection? <slot>
//! Enter passphrase: <admin PIN>
//! Replace existing key? (y/N) y
//! gpg> save
//! ```
//!
//! A dialogue that fails with a mediator failure is closed, the mediator is
//! restarted and a fresh dialogue is opened for the same subkey. Timeouts
//! and every other failure end the transfer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use keyward_core::{Fingerprint, KeyIdentity, KeySlot, REDACTED};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dialogue::{unexpected, DialogueDriver, DialogueFactory, EditKeyPrompts};
use crate::error::{ProvisionError, Result};
use crate::health::HealthManager;
use crate::secret::Pin;

/// Result of moving one subkey
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    Pending,
    Succeeded,
    Failed(String),
}

/// One transfer of subkeys onto the token
///
/// The admin PIN is only borrowed while the dialogues run; a returned
/// session no longer refers to it.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub target: Fingerprint,
    pub outcomes: BTreeMap<KeySlot, SlotOutcome>,
    /// Dialogues opened, retries included
    pub attempts: u32,
    /// Mediator restarts performed between attempts
    pub restarts: u32,
    pub started: Instant,
    pub timeout: Duration,
}

impl TransferSession {
    fn new(target: Fingerprint, slots: &[KeySlot], timeout: Duration) -> Self {
        Self {
            target,
            outcomes: slots.iter().map(|s| (*s, SlotOutcome::Pending)).collect(),
            attempts: 0,
            restarts: 0,
            started: Instant::now(),
            timeout,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(|o| *o == SlotOutcome::Succeeded)
    }
}

/// A transfer in progress, holding the borrowed admin PIN
struct ActiveTransfer<'p> {
    session: TransferSession,
    admin_pin: &'p Pin,
}

impl fmt::Debug for ActiveTransfer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTransfer")
            .field("session", &self.session)
            .field("admin_pin", &REDACTED)
            .finish()
    }
}

/// Drives the key-to-card dialogues
pub struct SessionDriver {
    factory: Arc<dyn DialogueFactory>,
    health: HealthManager,
    prompts: EditKeyPrompts,
}

impl SessionDriver {
    pub fn new(factory: Arc<dyn DialogueFactory>, health: HealthManager) -> Result<Self> {
        Ok(Self {
            factory,
            health,
            prompts: EditKeyPrompts::new()?,
        })
    }

    /// Move the subkeys for `target_slots` onto the token, in slot order
    ///
    /// `timeout` bounds each subkey's dialogue, touch confirmation included.
    pub async fn transfer(
        &self,
        identity: &KeyIdentity,
        target_slots: &[KeySlot],
        admin_pin: &Pin,
        timeout: Duration,
    ) -> Result<TransferSession> {
        let mut slots = target_slots.to_vec();
        slots.sort();
        slots.dedup();

        let mut active = ActiveTransfer {
            session: TransferSession::new(identity.master.fingerprint.clone(), &slots, timeout),
            admin_pin,
        };
        let mut budget = self.health.policy().budget();

        for slot in slots {
            let handle = identity.subkey(slot);
            loop {
                active.session.attempts += 1;
                info!(
                    "Moving {} subkey {} to slot {}",
                    slot,
                    handle.fingerprint.short(),
                    slot.number()
                );
                let result = self
                    .move_subkey(&active.session.target, handle.index, slot, active.admin_pin, timeout)
                    .await;

                match result {
                    Ok(()) => {
                        active.session.outcomes.insert(slot, SlotOutcome::Succeeded);
                        break;
                    }
                    Err(e) if e.is_retryable() && budget.try_consume() => {
                        warn!("{} transfer interrupted: {}; restarting mediator", slot, e);
                        self.health.restart_mediator().await?;
                        active.session.restarts += 1;
                        // A restart proves nothing until the card answers again
                        let report = self.health.ensure_healthy_with(&mut budget).await?;
                        active.session.restarts += report.restarts;
                    }
                    Err(e) => {
                        active
                            .session
                            .outcomes
                            .insert(slot, SlotOutcome::Failed(e.to_string()));
                        debug!(?active, "transfer aborted");
                        return Err(e);
                    }
                }
            }
        }

        info!(
            "Transfer finished in {:?} ({} dialogue(s))",
            active.session.elapsed(),
            active.session.attempts
        );
        Ok(active.session)
    }

    /// One complete dialogue for a single subkey
    async fn move_subkey(
        &self,
        master: &Fingerprint,
        index: usize,
        slot: KeySlot,
        admin_pin: &Pin,
        timeout: Duration,
    ) -> Result<()> {
        let mut dialogue = self.factory.open_edit_key(master).await?;
        let deadline = Instant::now() + timeout;
        let result = self
            .script(dialogue.as_mut(), index, slot, admin_pin, deadline, timeout)
            .await;
        // The dialogue is always reaped before any mediator restart
        let closed = dialogue.close().await;
        result?;
        closed
    }

    async fn script(
        &self,
        dialogue: &mut dyn DialogueDriver,
        index: usize,
        slot: KeySlot,
        admin_pin: &Pin,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<()> {
        let p = &self.prompts;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let stretch = |e: ProvisionError| match e {
            ProvisionError::DialogueTimeout { waiting_for, .. } => ProvisionError::DialogueTimeout {
                waiting_for,
                elapsed: timeout,
            },
            other => other,
        };

        self.await_ready(dialogue, remaining()).await.map_err(stretch)?;
        dialogue.send(&format!("key {}", index)).await?;
        debug!(sent = %format!("key {}", index));
        self.await_ready(dialogue, remaining()).await.map_err(stretch)?;
        dialogue.send("keytocard").await?;
        debug!(sent = "keytocard");

        let mut slot_answered = false;
        let mut pin_sent = false;
        loop {
            let prompts = [
                &p.slot_selection,
                &p.admin_pin,
                &p.replace,
                &p.ready,
                &p.pin_rejected,
                &p.communication,
                &p.error,
            ];
            let (matched, text) = dialogue
                .expect_any(&prompts, remaining())
                .await
                .map_err(stretch)?;
            match matched {
                0 => {
                    if slot_answered {
                        return Err(unexpected("slot chooser shown twice", &text));
                    }
                    let answer = slot.number().to_string();
                    dialogue.send(&answer).await?;
                    debug!(sent = %answer);
                    slot_answered = true;
                }
                // A second request means the card turned the first one down
                1 if pin_sent => {
                    return Err(ProvisionError::Pin(format!(
                        "admin PIN asked for again while moving {} key",
                        slot
                    )))
                }
                1 => {
                    dialogue.send_secret(admin_pin.expose()).await?;
                    debug!(sent = REDACTED);
                    pin_sent = true;
                }
                2 => {
                    dialogue.send("y").await?;
                    debug!(sent = "y");
                }
                3 => {
                    if !slot_answered {
                        return Err(unexpected("keytocard returned without a slot chooser", &text));
                    }
                    break;
                }
                _ if p.pin_rejected.find(&text).is_some() => {
                    return Err(ProvisionError::Pin(format!(
                        "admin PIN rejected while moving {} key",
                        slot
                    )))
                }
                _ => return Err(unexpected("keytocard failed", &text)),
            }
        }

        dialogue.send("save").await?;
        debug!(sent = "save");
        // Older editors ask before writing; newer ones just exit
        let closing = [&p.save, &p.communication, &p.error];
        match dialogue.expect_any(&closing, Duration::from_secs(5).min(remaining())).await {
            Ok((0, _)) => dialogue.send("y").await?,
            Ok((_, text)) => return Err(unexpected("save failed", &text)),
            Err(ProvisionError::DialogueTimeout { .. }) | Err(ProvisionError::Dialogue(_)) => {}
            Err(e) => return Err(e),
        }
        info!("{} key moved to slot {}", slot, slot.number());
        Ok(())
    }

    async fn await_ready(&self, dialogue: &mut dyn DialogueDriver, timeout: Duration) -> Result<()> {
        let p = &self.prompts;
        let prompts = [&p.ready, &p.communication, &p.error];
        match dialogue.expect_any(&prompts, timeout).await? {
            (0, _) => Ok(()),
            (_, text) => Err(unexpected("key editor refused", &text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        sample_identity, FakeMediator, ScriptedDialogueFactory, ScriptedStep,
    };
    use keyward_core::{Redactor, RetryPolicy};
    use crate::secret::PinKind;

    fn driver(factory: Arc<ScriptedDialogueFactory>, mediator: Arc<FakeMediator>) -> SessionDriver {
        let health = HealthManager::new(mediator, RetryPolicy::immediate(3), Duration::ZERO);
        SessionDriver::new(factory, health).unwrap()
    }

    fn admin(redactor: &Redactor) -> Pin {
        Pin::new(PinKind::Admin, "13579864", redactor).unwrap()
    }

    #[tokio::test]
    async fn test_three_subkeys_in_slot_order() {
        let factory = Arc::new(ScriptedDialogueFactory::new(vec![
            ScriptedStep::happy_transfer(KeySlot::Signature),
            ScriptedStep::happy_transfer(KeySlot::Encryption),
            ScriptedStep::happy_transfer(KeySlot::Authentication),
        ]));
        let mediator = Arc::new(FakeMediator::healthy());
        let redactor = Redactor::new();
        let pin = admin(&redactor);

        let session = driver(factory.clone(), mediator)
            .transfer(
                &sample_identity(),
                &[KeySlot::Authentication, KeySlot::Signature, KeySlot::Encryption],
                &pin,
                Duration::from_secs(120),
            )
            .await
            .unwrap();

        assert!(session.all_succeeded());
        assert_eq!(session.attempts, 3);
        let sent = factory.sent_lines();
        assert_eq!(sent[0], vec!["key 1", "keytocard", "1", "13579864", "save"]);
        assert_eq!(sent[1][0], "key 2");
        assert_eq!(sent[1][2], "2");
        assert_eq!(sent[2][2], "3");
    }

    #[tokio::test]
    async fn test_card_error_retries_same_subkey() {
        let factory = Arc::new(ScriptedDialogueFactory::new(vec![
            ScriptedStep::card_error(),
            ScriptedStep::happy_transfer(KeySlot::Signature),
        ]));
        let mediator = Arc::new(FakeMediator::healthy());
        let redactor = Redactor::new();
        let pin = admin(&redactor);

        let session = driver(factory.clone(), mediator.clone())
            .transfer(&sample_identity(), &[KeySlot::Signature], &pin, Duration::from_secs(120))
            .await
            .unwrap();

        assert_eq!(session.attempts, 2);
        assert_eq!(session.restarts, 1);
        assert_eq!(mediator.restarts(), 1);
        assert_eq!(factory.sent_lines()[1][0], "key 1");
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let factory = Arc::new(ScriptedDialogueFactory::new(vec![ScriptedStep::touch_never_given()]));
        let mediator = Arc::new(FakeMediator::healthy());
        let redactor = Redactor::new();
        let pin = admin(&redactor);

        let err = driver(factory.clone(), mediator.clone())
            .transfer(&sample_identity(), &[KeySlot::Signature], &pin, Duration::from_secs(120))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::DialogueTimeout { .. }));
        assert_eq!(factory.opened(), 1);
        assert_eq!(mediator.restarts(), 0);
    }

    #[tokio::test]
    async fn test_rejected_pin_is_fatal() {
        let factory = Arc::new(ScriptedDialogueFactory::new(vec![ScriptedStep::bad_pin()]));
        let mediator = Arc::new(FakeMediator::healthy());
        let redactor = Redactor::new();
        let pin = admin(&redactor);

        let err = driver(factory.clone(), mediator)
            .transfer(&sample_identity(), &[KeySlot::Signature], &pin, Duration::from_secs(120))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Pin(_)));
        assert_eq!(factory.opened(), 1);
    }

    #[tokio::test]
    async fn test_repeated_pin_request_sends_pin_once() {
        let factory = Arc::new(ScriptedDialogueFactory::new(vec![ScriptedStep::pin_asked_twice()]));
        let mediator = Arc::new(FakeMediator::healthy());
        let redactor = Redactor::new();
        let pin = admin(&redactor);

        let err = driver(factory.clone(), mediator.clone())
            .transfer(&sample_identity(), &[KeySlot::Signature], &pin, Duration::from_secs(120))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Pin(_)));
        let sent = factory.sent_lines();
        assert_eq!(sent[0].iter().filter(|line| *line == "13579864").count(), 1);
        assert!(!sent[0].iter().any(|line| line == "save"));
        assert_eq!(factory.opened(), 1);
        assert_eq!(mediator.restarts(), 0);
    }

    #[tokio::test]
    async fn test_pin_request_split_across_reads() {
        let factory = Arc::new(ScriptedDialogueFactory::new(vec![
            ScriptedStep::split_pin_request(KeySlot::Signature),
        ]));
        let mediator = Arc::new(FakeMediator::healthy());
        let redactor = Redactor::new();
        let pin = admin(&redactor);

        let session = driver(factory.clone(), mediator)
            .transfer(&sample_identity(), &[KeySlot::Signature], &pin, Duration::from_secs(120))
            .await
            .unwrap();

        assert!(session.all_succeeded());
        assert_eq!(factory.sent_lines()[0], vec!["key 1", "keytocard", "1", "13579864", "save"]);
    }

    #[tokio::test]
    async fn test_restart_is_rechecked_before_retry() {
        let factory = Arc::new(ScriptedDialogueFactory::new(vec![
            ScriptedStep::card_error(),
            ScriptedStep::happy_transfer(KeySlot::Signature),
        ]));
        // The first health check after the restart still sees the card error
        let mediator = Arc::new(FakeMediator::failing_times(1));
        let redactor = Redactor::new();
        let pin = admin(&redactor);

        let session = driver(factory.clone(), mediator.clone())
            .transfer(&sample_identity(), &[KeySlot::Signature], &pin, Duration::from_secs(120))
            .await
            .unwrap();

        assert!(session.all_succeeded());
        assert_eq!(mediator.probes(), 2);
        assert_eq!(mediator.restarts(), 2);
        assert_eq!(session.restarts, 2);
        assert_eq!(factory.opened(), 2);
    }

    #[tokio::test]
    async fn test_dead_mediator_after_restart_stops_retries() {
        let factory = Arc::new(ScriptedDialogueFactory::new(vec![
            ScriptedStep::card_error(),
            ScriptedStep::happy_transfer(KeySlot::Signature),
        ]));
        let mediator = Arc::new(FakeMediator::always_failing());
        let redactor = Redactor::new();
        let pin = admin(&redactor);

        let err = driver(factory.clone(), mediator.clone())
            .transfer(&sample_identity(), &[KeySlot::Signature], &pin, Duration::from_secs(120))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::HardwareCommunication(_)));
        assert_eq!(mediator.restarts(), 3);
        assert_eq!(factory.opened(), 1);
    }

    #[tokio::test]
    async fn test_persistent_card_error_gives_up() {
        let factory = Arc::new(ScriptedDialogueFactory::new(vec![
            ScriptedStep::card_error(),
            ScriptedStep::card_error(),
            ScriptedStep::card_error(),
            ScriptedStep::card_error(),
        ]));
        let mediator = Arc::new(FakeMediator::healthy());
        let redactor = Redactor::new();
        let pin = admin(&redactor);

        let err = driver(factory.clone(), mediator.clone())
            .transfer(&sample_identity(), &[KeySlot::Signature], &pin, Duration::from_secs(120))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::HardwareCommunication(_)));
        assert_eq!(factory.opened(), 4);
        assert_eq!(mediator.restarts(), 3);
    }
}
