//! Error types for keyward core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Invalid keygrip: {0}")]
    InvalidKeygrip(String),

    #[error("Invalid user ID: {0}")]
    InvalidUserId(String),

    #[error("No card detected: {0}")]
    NoCard(String),

    #[error("Card status parse error: {0}")]
    CardStatus(String),

    #[error("Key listing parse error: {0}")]
    KeyListing(String),

    #[error("Unknown {kind}: {value}")]
    UnknownValue { kind: &'static str, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
