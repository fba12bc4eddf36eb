//! Secret redaction for the run log
//!
//! Secrets (PINs) are registered for exactly as long as they are in scope.
//! Every byte written to a log sink passes through `Redactor::redact`, which
//! replaces each registered value with a fixed placeholder.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use zeroize::Zeroizing;

/// Placeholder substituted for every redacted value
pub const REDACTED: &str = "[REDACTED]";

type SecretList = Vec<(u64, Zeroizing<String>)>;

/// Shared registry of values that must never reach the log
#[derive(Clone, Default)]
pub struct Redactor {
    secrets: Arc<RwLock<SecretList>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("registered", &self.len())
            .finish()
    }
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret until the returned guard is dropped
    pub fn register(&self, secret: &str) -> RedactionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !secret.is_empty() {
            let mut secrets = self.secrets.write().unwrap_or_else(PoisonError::into_inner);
            secrets.push((id, Zeroizing::new(secret.to_string())));
            // Longest first so a secret containing another is replaced whole
            secrets.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        }
        RedactionGuard {
            redactor: self.clone(),
            id,
        }
    }

    /// Number of currently registered secrets
    pub fn len(&self) -> usize {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace every registered secret in `text`
    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let secrets = self.secrets.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Cow::Borrowed(text);
        for (_, secret) in secrets.iter() {
            if out.contains(secret.as_str()) {
                out = Cow::Owned(out.replace(secret.as_str(), REDACTED));
            }
        }
        out
    }

    /// Byte-level variant for log writers
    pub fn redact_bytes<'a>(&self, bytes: &'a [u8]) -> Cow<'a, [u8]> {
        if self.is_empty() {
            return Cow::Borrowed(bytes);
        }
        match String::from_utf8_lossy(bytes) {
            Cow::Borrowed(text) => match self.redact(text) {
                Cow::Borrowed(_) => Cow::Borrowed(bytes),
                Cow::Owned(redacted) => Cow::Owned(redacted.into_bytes()),
            },
            Cow::Owned(text) => Cow::Owned(self.redact(&text).into_owned().into_bytes()),
        }
    }

    fn unregister(&self, id: u64) {
        let mut secrets = self.secrets.write().unwrap_or_else(PoisonError::into_inner);
        secrets.retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Keeps a secret registered; unregisters and zeroizes it on drop
pub struct RedactionGuard {
    redactor: Redactor,
    id: u64,
}

impl Drop for RedactionGuard {
    fn drop(&mut self) {
        self.redactor.unregister(self.id);
    }
}
