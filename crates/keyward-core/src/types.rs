//! Core enums and newtypes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hardware key slot of an OpenPGP applet
///
/// The discriminant order matches the slot numbers the card editor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySlot {
    /// Slot 1
    Signature,
    /// Slot 2
    Encryption,
    /// Slot 3
    Authentication,
}

impl KeySlot {
    /// All slots in transfer order
    pub const ALL: [KeySlot; 3] = [
        KeySlot::Signature,
        KeySlot::Encryption,
        KeySlot::Authentication,
    ];

    /// Slot number as offered by the `keytocard` selection prompt
    pub fn number(self) -> u8 {
        match self {
            KeySlot::Signature => 1,
            KeySlot::Encryption => 2,
            KeySlot::Authentication => 3,
        }
    }

    /// Label prefix used by the card status report
    pub fn status_label(self) -> &'static str {
        match self {
            KeySlot::Signature => "Signature key",
            KeySlot::Encryption => "Encryption key",
            KeySlot::Authentication => "Authentication key",
        }
    }

    /// Short key reference understood by `ykman openpgp keys`
    pub fn ykman_name(self) -> &'static str {
        match self {
            KeySlot::Signature => "sig",
            KeySlot::Encryption => "enc",
            KeySlot::Authentication => "aut",
        }
    }

    /// Usage role bound to this slot
    pub fn usage(self) -> KeyUsage {
        match self {
            KeySlot::Signature => KeyUsage::Sign,
            KeySlot::Encryption => KeyUsage::Encrypt,
            KeySlot::Authentication => KeyUsage::Authenticate,
        }
    }
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeySlot::Signature => "signature",
            KeySlot::Encryption => "encryption",
            KeySlot::Authentication => "authentication",
        };
        f.write_str(name)
    }
}

/// Capability of a subkey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUsage {
    Sign,
    Encrypt,
    Authenticate,
}

impl KeyUsage {
    /// Usage keyword accepted by `gpg --quick-add-key`
    pub fn gpg_usage(self) -> &'static str {
        match self {
            KeyUsage::Sign => "sign",
            KeyUsage::Encrypt => "encr",
            KeyUsage::Authenticate => "auth",
        }
    }

    /// Slot this usage is transferred to
    pub fn slot(self) -> KeySlot {
        match self {
            KeyUsage::Sign => KeySlot::Signature,
            KeyUsage::Encrypt => KeySlot::Encryption,
            KeyUsage::Authenticate => KeySlot::Authentication,
        }
    }

    /// Parse a capability letter from a colon-delimited key listing
    pub fn from_capability(c: char) -> Option<Self> {
        match c {
            's' | 'S' => Some(KeyUsage::Sign),
            'e' | 'E' => Some(KeyUsage::Encrypt),
            'a' | 'A' => Some(KeyUsage::Authenticate),
            _ => None,
        }
    }
}

/// Key algorithm family used for the master key and subkeys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    #[default]
    Ed25519,
    Rsa4096,
}

impl KeyKind {
    /// Algorithm string for the certify-only master key
    pub fn master_algo(self) -> &'static str {
        match self {
            KeyKind::Ed25519 => "ed25519",
            KeyKind::Rsa4096 => "rsa4096",
        }
    }

    /// Algorithm string for a subkey of the given usage
    pub fn subkey_algo(self, usage: KeyUsage) -> &'static str {
        match (self, usage) {
            (KeyKind::Ed25519, KeyUsage::Encrypt) => "cv25519",
            (KeyKind::Ed25519, _) => "ed25519",
            (KeyKind::Rsa4096, _) => "rsa4096",
        }
    }
}

impl FromStr for KeyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" | "ecc" | "curve25519" => Ok(KeyKind::Ed25519),
            "rsa4096" | "rsa" => Ok(KeyKind::Rsa4096),
            _ => Err(Error::UnknownValue {
                kind: "key kind",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.master_algo())
    }
}

/// Touch requirement applied to a hardware slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TouchPolicy {
    /// Touch is not required
    Off,
    /// Touch is required for each operation
    #[default]
    On,
    /// Touch is required and cannot be changed without a reset
    Fixed,
    /// Touch is cached for 15 seconds
    Cached,
    /// Cached and cannot be changed without a reset
    CachedFixed,
}

impl TouchPolicy {
    /// Value accepted by `ykman openpgp keys set-touch`
    pub fn ykman_value(self) -> &'static str {
        match self {
            TouchPolicy::Off => "off",
            TouchPolicy::On => "on",
            TouchPolicy::Fixed => "fixed",
            TouchPolicy::Cached => "cached",
            TouchPolicy::CachedFixed => "cached-fixed",
        }
    }

    /// Whether operations on the slot wait for a physical touch
    pub fn requires_touch(self) -> bool {
        !matches!(self, TouchPolicy::Off)
    }
}

impl FromStr for TouchPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(TouchPolicy::Off),
            "on" => Ok(TouchPolicy::On),
            "fixed" => Ok(TouchPolicy::Fixed),
            "cached" => Ok(TouchPolicy::Cached),
            "cached-fixed" | "cached_fixed" => Ok(TouchPolicy::CachedFixed),
            _ => Err(Error::UnknownValue {
                kind: "touch policy",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for TouchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ykman_value())
    }
}

/// OpenPGP key fingerprint, stored as uppercase hex without spaces
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a fingerprint, tolerating the grouped form printed by card status
    pub fn parse(s: &str) -> Result<Self> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        // v4 keys have 20-byte fingerprints, v5 keys 32-byte ones
        if !(compact.len() == 40 || compact.len() == 64) {
            return Err(Error::InvalidFingerprint(s.to_string()));
        }
        if !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidFingerprint(s.to_string()));
        }
        Ok(Self(compact.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Long key ID (last 16 hex digits)
    pub fn short(&self) -> &str {
        &self.0[self.0.len() - 16..]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Keygrip naming a key file under `private-keys-v1.d`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Keygrip(String);

impl Keygrip {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 40 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidKeygrip(s.to_string()));
        }
        Ok(Self(s.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the key (or stub) for this keygrip
    pub fn file_name(&self) -> String {
        format!("{}.key", self.0)
    }
}

impl fmt::Display for Keygrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Keygrip {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Keygrip> for String {
    fn from(value: Keygrip) -> Self {
        value.0
    }
}
