//! Scoped PIN handling
//!
//! A `Pin` holds its digits in zeroizing memory and keeps them registered
//! with the log redactor for as long as the value lives.

use std::fmt;

use keyward_core::{RedactionGuard, Redactor, REDACTED};
use zeroize::Zeroizing;

use crate::error::{ProvisionError, Result};

/// Which applet PIN a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    User,
    Admin,
}

impl PinKind {
    /// Minimum length the applet accepts
    pub fn min_len(self) -> usize {
        match self {
            PinKind::User => 6,
            PinKind::Admin => 8,
        }
    }

    pub fn max_len(self) -> usize {
        127
    }

    /// Subcommand name for `ykman openpgp access`
    pub fn ykman_command(self) -> &'static str {
        match self {
            PinKind::User => "change-pin",
            PinKind::Admin => "change-admin-pin",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PinKind::User => "user PIN",
            PinKind::Admin => "admin PIN",
        }
    }
}

impl fmt::Display for PinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A PIN value, redacted from logs while alive and zeroized on drop
pub struct Pin {
    kind: PinKind,
    value: Zeroizing<String>,
    _guard: RedactionGuard,
}

impl Pin {
    /// Validate and register a PIN with the redactor
    pub fn new(kind: PinKind, value: &str, redactor: &Redactor) -> Result<Self> {
        let guard = redactor.register(value);
        let pin = Self {
            kind,
            value: Zeroizing::new(value.to_string()),
            _guard: guard,
        };
        pin.validate()?;
        Ok(pin)
    }

    /// Wrap a factory default without length checks
    pub fn factory(kind: PinKind, redactor: &Redactor) -> Self {
        let value = match kind {
            PinKind::User => keyward_core::FACTORY_USER_PIN,
            PinKind::Admin => keyward_core::FACTORY_ADMIN_PIN,
        };
        Self {
            kind,
            value: Zeroizing::new(value.to_string()),
            _guard: redactor.register(value),
        }
    }

    fn validate(&self) -> Result<()> {
        let len = self.value.chars().count();
        if len < self.kind.min_len() {
            return Err(ProvisionError::Pin(format!(
                "{} must be at least {} characters",
                self.kind,
                self.kind.min_len()
            )));
        }
        if len > self.kind.max_len() {
            return Err(ProvisionError::Pin(format!(
                "{} must be at most {} characters",
                self.kind,
                self.kind.max_len()
            )));
        }
        if self.value.chars().any(char::is_control) {
            return Err(ProvisionError::Pin(format!(
                "{} contains control characters",
                self.kind
            )));
        }
        if self.is_factory_default() {
            return Err(ProvisionError::Pin(format!(
                "{} must differ from the factory default",
                self.kind
            )));
        }
        Ok(())
    }

    pub fn kind(&self) -> PinKind {
        self.kind
    }

    /// Expose the PIN for exactly one write to a subprocess
    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn is_factory_default(&self) -> bool {
        let factory = match self.kind {
            PinKind::User => keyward_core::FACTORY_USER_PIN,
            PinKind::Admin => keyward_core::FACTORY_ADMIN_PIN,
        };
        self.value.as_str() == factory
    }

    /// Compare without an early exit on the first differing digit
    pub fn matches(&self, other: &Pin) -> bool {
        let a = self.value.as_bytes();
        let b = other.value.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin")
            .field("kind", &self.kind)
            .field("value", &REDACTED)
            .finish()
    }
}

/// The two PINs chosen during initialization
#[derive(Debug)]
pub struct PinPair {
    pub user: Pin,
    pub admin: Pin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_rules() {
        let redactor = Redactor::new();
        assert!(Pin::new(PinKind::User, "13579", &redactor).is_err());
        assert!(Pin::new(PinKind::User, "135798", &redactor).is_ok());
        assert!(Pin::new(PinKind::Admin, "1357986", &redactor).is_err());
        assert!(Pin::new(PinKind::Admin, "13579864", &redactor).is_ok());
    }

    #[test]
    fn test_factory_default_rejected() {
        let redactor = Redactor::new();
        let err = Pin::new(PinKind::Admin, "12345678", &redactor).unwrap_err();
        assert!(matches!(err, ProvisionError::Pin(_)));
        assert!(Pin::factory(PinKind::Admin, &redactor).is_factory_default());
    }

    #[test]
    fn test_debug_hides_value() {
        let redactor = Redactor::new();
        let pin = Pin::new(PinKind::User, "135798", &redactor).unwrap();
        let debug = format!("{:?}", pin);
        assert!(!debug.contains("135798"));
        assert!(debug.contains(REDACTED));
    }

    #[test]
    fn test_registered_only_while_alive() {
        let redactor = Redactor::new();
        {
            let _pin = Pin::new(PinKind::User, "135798", &redactor).unwrap();
            assert_eq!(redactor.redact("pin 135798"), "pin [REDACTED]");
        }
        assert!(redactor.is_empty());
    }

    #[test]
    fn test_rejected_pin_is_not_left_registered() {
        let redactor = Redactor::new();
        let _ = Pin::new(PinKind::User, "123", &redactor);
        assert!(redactor.is_empty());
    }

    #[test]
    fn test_matches() {
        let redactor = Redactor::new();
        let a = Pin::new(PinKind::User, "135798", &redactor).unwrap();
        let b = Pin::new(PinKind::User, "135798", &redactor).unwrap();
        let c = Pin::new(PinKind::User, "135799", &redactor).unwrap();
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }
}
