//! Cryptographic identity being provisioned

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Fingerprint, KeySlot, KeyUsage, Keygrip};

/// Name and contact address bound to the master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserId {
    pub name: String,
    pub email: String,
}

impl UserId {
    /// Validate and build a user ID
    pub fn new(name: &str, email: &str) -> Result<Self> {
        let name = name.trim();
        let email = email.trim();

        if name.is_empty() {
            return Err(Error::InvalidUserId("name must not be empty".to_string()));
        }
        if name.contains(['<', '>']) || name.chars().any(char::is_control) {
            return Err(Error::InvalidUserId(format!(
                "name contains forbidden characters: {name:?}"
            )));
        }
        if !is_plausible_email(email) {
            return Err(Error::InvalidUserId(format!("malformed email address: {email:?}")));
        }

        Ok(Self {
            name: name.to_string(),
            email: email.to_string(),
        })
    }

    /// Parse the `Name <email>` form used in key listings
    pub fn parse(uid: &str) -> Result<Self> {
        let uid = uid.trim();
        let (name, rest) = uid
            .split_once('<')
            .ok_or_else(|| Error::InvalidUserId(format!("no address in {uid:?}")))?;
        let email = rest
            .strip_suffix('>')
            .ok_or_else(|| Error::InvalidUserId(format!("unterminated address in {uid:?}")))?;
        Self::new(name, email)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

fn is_plausible_email(email: &str) -> bool {
    if email.chars().any(|c| c.is_whitespace() || c == '<' || c == '>') {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

/// Reference to one key of the identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    pub fingerprint: Fingerprint,
    pub keygrip: Option<Keygrip>,
    /// Position among the subkeys in the key listing (1-based, 0 for the master key)
    pub index: usize,
}

/// Master key plus the three role subkeys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIdentity {
    pub user_id: Option<UserId>,
    pub master: KeyHandle,
    pub signing: KeyHandle,
    pub encryption: KeyHandle,
    pub authentication: KeyHandle,
}

impl KeyIdentity {
    /// Subkey destined for the given slot
    pub fn subkey(&self, slot: KeySlot) -> &KeyHandle {
        match slot {
            KeySlot::Signature => &self.signing,
            KeySlot::Encryption => &self.encryption,
            KeySlot::Authentication => &self.authentication,
        }
    }

    /// Slot and handle pairs in transfer order
    pub fn subkeys(&self) -> impl Iterator<Item = (KeySlot, &KeyHandle)> {
        KeySlot::ALL.into_iter().map(move |slot| (slot, self.subkey(slot)))
    }

    /// Keygrips of all three subkeys, if the listing provided them
    pub fn subkey_keygrips(&self) -> Option<Vec<&Keygrip>> {
        self.subkeys().map(|(_, h)| h.keygrip.as_ref()).collect()
    }

    /// Parse a colon-delimited key listing (`--with-colons --with-keygrip`)
    ///
    /// The first primary key record starts the identity. When several
    /// subkeys share a capability the last one listed wins, which is the
    /// most recently added.
    pub fn from_colon_listing(listing: &str) -> Result<Self> {
        #[derive(Clone, Copy, PartialEq)]
        enum Record {
            None,
            Primary,
            Sub(usize),
        }

        struct Pending {
            fingerprint: Option<Fingerprint>,
            keygrip: Option<Keygrip>,
            usages: Vec<KeyUsage>,
        }

        let mut user_id = None;
        let mut primary: Option<Pending> = None;
        let mut subs: Vec<Pending> = Vec::new();
        let mut current = Record::None;

        for line in listing.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            match fields.first().copied() {
                Some("sec") | Some("pub") => {
                    if primary.is_some() {
                        // A second primary key belongs to another identity
                        break;
                    }
                    primary = Some(Pending {
                        fingerprint: None,
                        keygrip: None,
                        usages: Vec::new(),
                    });
                    current = Record::Primary;
                }
                Some("ssb") | Some("sub") => {
                    if primary.is_none() {
                        continue;
                    }
                    let caps = fields.get(11).copied().unwrap_or("");
                    let usages = caps.chars().filter_map(KeyUsage::from_capability).collect();
                    subs.push(Pending {
                        fingerprint: None,
                        keygrip: None,
                        usages,
                    });
                    current = Record::Sub(subs.len() - 1);
                }
                Some("fpr") => {
                    let value = fields.get(9).copied().unwrap_or("");
                    let fpr = Fingerprint::parse(value)
                        .map_err(|e| Error::KeyListing(e.to_string()))?;
                    match current {
                        Record::Primary => {
                            if let Some(p) = primary.as_mut() {
                                p.fingerprint.get_or_insert(fpr);
                            }
                        }
                        Record::Sub(i) => {
                            subs[i].fingerprint.get_or_insert(fpr);
                        }
                        Record::None => {}
                    }
                }
                Some("grp") => {
                    let value = fields.get(9).copied().unwrap_or("");
                    let grip =
                        Keygrip::parse(value).map_err(|e| Error::KeyListing(e.to_string()))?;
                    match current {
                        Record::Primary => {
                            if let Some(p) = primary.as_mut() {
                                p.keygrip.get_or_insert(grip);
                            }
                        }
                        Record::Sub(i) => {
                            subs[i].keygrip.get_or_insert(grip);
                        }
                        Record::None => {}
                    }
                }
                Some("uid") if user_id.is_none() && primary.is_some() => {
                    let value = fields.get(9).copied().unwrap_or("");
                    user_id = UserId::parse(&unescape_colon_field(value)).ok();
                }
                _ => {}
            }
        }

        let primary = primary.ok_or_else(|| Error::KeyListing("no primary key".to_string()))?;
        let master = KeyHandle {
            fingerprint: primary
                .fingerprint
                .ok_or_else(|| Error::KeyListing("primary key has no fingerprint".to_string()))?,
            keygrip: primary.keygrip,
            index: 0,
        };

        let pick = |usage: KeyUsage| -> Result<KeyHandle> {
            let (i, sub) = subs
                .iter()
                .enumerate()
                .rev()
                .find(|(_, s)| s.usages.contains(&usage))
                .ok_or_else(|| {
                    Error::KeyListing(format!("no {} subkey", usage.gpg_usage()))
                })?;
            Ok(KeyHandle {
                fingerprint: sub.fingerprint.clone().ok_or_else(|| {
                    Error::KeyListing(format!("subkey {} has no fingerprint", i + 1))
                })?,
                keygrip: sub.keygrip.clone(),
                index: i + 1,
            })
        };

        Ok(Self {
            user_id,
            signing: pick(KeyUsage::Sign)?,
            encryption: pick(KeyUsage::Encrypt)?,
            authentication: pick(KeyUsage::Authenticate)?,
            master,
        })
    }
}

/// Undo the `\xNN` escaping used in colon listings
fn unescape_colon_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find("\\x") {
        out.push_str(&rest[..pos]);
        let hex_part = rest.get(pos + 2..pos + 4);
        match hex_part.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(byte) => {
                out.push(byte as char);
                rest = &rest[pos + 4..];
            }
            None => {
                out.push_str("\\x");
                rest = &rest[pos + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}
