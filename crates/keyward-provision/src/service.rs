//! Smartcard service abstraction
//!
//! Every cryptographic operation is delegated to an external service. The
//! production implementation is [`crate::gpg::GpgService`]; tests use the
//! scripted card in `crate::testing`.

use async_trait::async_trait;
use keyward_core::{Fingerprint, KeyHandle, KeyIdentity, KeyKind, KeySlot, KeyUsage, TouchPolicy, UserId};

use crate::error::Result;
use crate::secret::{Pin, PinKind};

/// Operations the provisioning workflow needs from the card service
#[async_trait]
pub trait SmartcardService: Send + Sync {
    /// Factory-reset the OpenPGP applet
    async fn reset(&self) -> Result<()>;

    /// Change a PIN; a rejection by the token is a fatal `Pin` error
    async fn set_pin(&self, kind: PinKind, current: &Pin, new: &Pin) -> Result<()>;

    /// Apply a touch policy to one slot
    async fn set_touch_policy(&self, slot: KeySlot, policy: TouchPolicy, admin_pin: &Pin)
        -> Result<()>;

    /// Generate a certify-only master key
    async fn generate_master_key(
        &self,
        user_id: &UserId,
        kind: KeyKind,
        expiry: &str,
    ) -> Result<KeyHandle>;

    /// Add one subkey under `master`
    async fn add_subkey(
        &self,
        master: &Fingerprint,
        kind: KeyKind,
        usage: KeyUsage,
        expiry: &str,
    ) -> Result<KeyHandle>;

    /// Import key material and return the primary fingerprint
    async fn import_key(&self, blob: &[u8]) -> Result<Fingerprint>;

    /// Read back the identity, subkeys and keygrips of a key
    async fn describe_key(&self, fingerprint: &Fingerprint) -> Result<KeyIdentity>;

    /// Raw card status text
    async fn card_status(&self) -> Result<String>;

    /// Armored public key
    async fn export_public(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>>;

    /// Armored secret subkeys (master stays out)
    async fn export_secret_subkeys(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>>;

    /// Authentication key in OpenSSH format
    async fn export_ssh(&self, fingerprint: &Fingerprint) -> Result<String>;

    /// Sign a short message with `signing_key` on the card; false when the card refused
    async fn sign_test(&self, signing_key: &Fingerprint, user_pin: &Pin) -> Result<bool>;
}
