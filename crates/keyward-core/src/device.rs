//! Parsed view of the attached token
//!
//! The token is described by the human-readable card status report of the
//! smartcard service. Only the fields the workflow gates on are extracted;
//! everything else stays in the raw text kept by callers for diagnostics.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Fingerprint, KeySlot};

/// Occupancy of one hardware slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Empty,
    Occupied {
        /// Key reference as printed by the card (usually a fingerprint)
        reference: String,
    },
}

impl SlotState {
    /// Classify a status value, treating the `none` sentinel as empty
    pub fn from_status_value(value: &str) -> Self {
        let trimmed = value.trim();
        let bare = trimmed.trim_start_matches('[').trim_end_matches(']').trim();
        if bare.is_empty() || bare.eq_ignore_ascii_case("none") {
            SlotState::Empty
        } else {
            SlotState::Occupied {
                reference: trimmed.to_string(),
            }
        }
    }

    pub fn is_occupied(&self) -> bool {
        matches!(self, SlotState::Occupied { .. })
    }

    /// Fingerprint of the key in the slot, if the reference parses as one
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match self {
            SlotState::Empty => None,
            SlotState::Occupied { reference } => Fingerprint::parse(reference).ok(),
        }
    }
}

/// Occupancy of all three slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMap {
    pub signature: SlotState,
    pub encryption: SlotState,
    pub authentication: SlotState,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self {
            signature: SlotState::Empty,
            encryption: SlotState::Empty,
            authentication: SlotState::Empty,
        }
    }
}

impl SlotMap {
    pub fn get(&self, slot: KeySlot) -> &SlotState {
        match slot {
            KeySlot::Signature => &self.signature,
            KeySlot::Encryption => &self.encryption,
            KeySlot::Authentication => &self.authentication,
        }
    }

    fn set(&mut self, slot: KeySlot, state: SlotState) {
        match slot {
            KeySlot::Signature => self.signature = state,
            KeySlot::Encryption => self.encryption = state,
            KeySlot::Authentication => self.authentication = state,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (KeySlot, &SlotState)> {
        KeySlot::ALL.into_iter().map(move |slot| (slot, self.get(slot)))
    }

    pub fn all_occupied(&self) -> bool {
        self.iter().all(|(_, state)| state.is_occupied())
    }

    pub fn all_empty(&self) -> bool {
        self.iter().all(|(_, state)| !state.is_occupied())
    }
}

/// Remaining PIN attempts reported by the applet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRetryCounters {
    pub user: u8,
    pub reset_code: u8,
    pub admin: u8,
}

/// Attached token as reported by card status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub version: Option<String>,
    pub manufacturer: Option<String>,
    pub slots: SlotMap,
    pub pin_retries: Option<PinRetryCounters>,
}

/// Markers the service prints instead of a report when no card answers
const NO_CARD_MARKERS: &[&str] = &[
    "card not present",
    "no such device",
    "selecting card failed",
    "openpgp card not available",
    "no card",
];

impl Device {
    /// Parse a card status report
    ///
    /// Lines have the form `Label ....: value`; the padding dots vary between
    /// labels and tool versions, so labels are compared after stripping them.
    pub fn from_card_status(raw: &str) -> Result<Self> {
        let mut serial = None;
        let mut version = None;
        let mut manufacturer = None;
        let mut pin_retries = None;
        let mut slots = SlotMap::default();
        let mut seen_slots = 0usize;

        for line in raw.lines() {
            let Some((label, value)) = split_status_line(line) else {
                continue;
            };
            let value = value.trim();

            match label.as_str() {
                "serial number" => serial = Some(value.to_string()),
                "version" => version = Some(value.to_string()),
                "manufacturer" => manufacturer = Some(value.to_string()),
                "pin retry counter" => pin_retries = parse_retry_counters(value),
                _ => {
                    if let Some(slot) = KeySlot::ALL
                        .into_iter()
                        .find(|s| s.status_label().eq_ignore_ascii_case(&label))
                    {
                        slots.set(slot, SlotState::from_status_value(value));
                        seen_slots += 1;
                    }
                }
            }
        }

        let Some(serial) = serial else {
            let lowered = raw.to_ascii_lowercase();
            if let Some(marker) = NO_CARD_MARKERS.iter().find(|m| lowered.contains(*m)) {
                return Err(Error::NoCard(marker.to_string()));
            }
            return Err(Error::CardStatus("no serial number in card status".to_string()));
        };

        if seen_slots == 0 {
            return Err(Error::CardStatus(
                "card status lists no key slots".to_string(),
            ));
        }

        Ok(Self {
            serial,
            version,
            manufacturer,
            slots,
            pin_retries,
        })
    }

    /// One-line summary used in logs and reports
    pub fn summary(&self) -> String {
        format!(
            "{} serial {} (applet {})",
            self.manufacturer.as_deref().unwrap_or("unknown vendor"),
            self.serial,
            self.version.as_deref().unwrap_or("?")
        )
    }
}

/// Split `Label ....: value` into a normalised lowercase label and the value
fn split_status_line(line: &str) -> Option<(String, &str)> {
    let (label, value) = line.split_once(':')?;
    let label = label.trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    if label.is_empty() || label.starts_with(char::is_whitespace) {
        return None;
    }
    Some((label.to_ascii_lowercase(), value))
}

fn parse_retry_counters(value: &str) -> Option<PinRetryCounters> {
    let mut parts = value.split_whitespace().map(|p| p.parse::<u8>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(user)), Some(Ok(reset_code)), Some(Ok(admin))) => Some(PinRetryCounters {
            user,
            reset_code,
            admin,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_CARD: &str = "\
Reader ...........: Yubico YubiKey OTP FIDO CCID 00 00
Application ID ...: D2760001240103040006123456780000
Application type .: OpenPGP
Version ..........: 3.4
Manufacturer .....: Yubico
Serial number ....: 12345678
Name of cardholder: [not set]
PIN retry counter : 3 0 3
Signature counter : 0
Signature key ....: [none]
Encryption key....: [none]
Authentication key: [none]
General key info..: [none]
";

    const LOADED_CARD: &str = "\
Version ..........: 3.4
Manufacturer .....: Yubico
Serial number ....: 12345678
PIN retry counter : 3 0 3
Signature key ....: 1111 1111 1111 1111 1111  1111 1111 1111 1111 1111
      created ....: 2024-01-01 00:00:00
Encryption key....: 2222 2222 2222 2222 2222  2222 2222 2222 2222 2222
      created ....: 2024-01-01 00:00:00
Authentication key: 3333 3333 3333 3333 3333  3333 3333 3333 3333 3333
      created ....: 2024-01-01 00:00:00
";

    #[test]
    fn test_parse_empty_card() {
        let device = Device::from_card_status(EMPTY_CARD).unwrap();
        assert_eq!(device.serial, "12345678");
        assert_eq!(device.version.as_deref(), Some("3.4"));
        assert_eq!(device.manufacturer.as_deref(), Some("Yubico"));
        assert!(device.slots.all_empty());
        assert_eq!(
            device.pin_retries,
            Some(PinRetryCounters {
                user: 3,
                reset_code: 0,
                admin: 3
            })
        );
    }

    #[test]
    fn test_parse_loaded_card() {
        let device = Device::from_card_status(LOADED_CARD).unwrap();
        assert!(device.slots.all_occupied());
        let fpr = device.slots.get(KeySlot::Encryption).fingerprint().unwrap();
        assert_eq!(fpr.as_str(), "2".repeat(40));
    }

    #[test]
    fn test_bare_none_sentinel_is_empty() {
        let status = LOADED_CARD.replace(
            "Signature key ....: 1111 1111 1111 1111 1111  1111 1111 1111 1111 1111",
            "Signature key: none",
        );
        let device = Device::from_card_status(&status).unwrap();
        assert!(!device.slots.get(KeySlot::Signature).is_occupied());
        assert!(device.slots.get(KeySlot::Encryption).is_occupied());
    }

    #[test]
    fn test_no_card_detected() {
        let err = Device::from_card_status("gpg: selecting card failed: No such device\n")
            .unwrap_err();
        assert!(matches!(err, Error::NoCard(_)));
    }

    #[test]
    fn test_created_lines_do_not_confuse_slots() {
        let device = Device::from_card_status(LOADED_CARD).unwrap();
        assert_eq!(device.slots.iter().filter(|(_, s)| s.is_occupied()).count(), 3);
    }
}
