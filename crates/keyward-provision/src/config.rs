//! Provisioning configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use keyward_core::{KeyKind, RetryPolicy, TouchPolicy, DEFAULT_STUB_THRESHOLD, DEFAULT_TRANSFER_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

/// Environment variable naming an alternate config file
pub const CONFIG_ENV: &str = "KEYWARD_CONFIG";

/// Provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// GnuPG home holding the keyring and `private-keys-v1.d`
    pub gnupg_home: PathBuf,

    /// Smartcard service binaries
    pub gpg_binary: PathBuf,
    pub gpgconf_binary: PathBuf,
    pub gpg_connect_agent_binary: PathBuf,
    pub ykman_binary: PathBuf,

    /// Directory for per-run log files
    pub log_dir: PathBuf,

    /// Directory backups are written under
    pub backup_dir: PathBuf,

    /// Bound for one key-to-card dialogue including touch confirmation (seconds)
    pub transfer_timeout_secs: u64,

    /// Bound for non-interactive service commands (seconds)
    pub command_timeout_secs: u64,

    /// Key files above this size count as full private keys (bytes)
    pub stub_size_threshold: u64,

    /// Mediator restart policy for health checks, transfer and verification
    pub retry: RetryPolicy,

    /// Pause after terminating and after relaunching the mediator (milliseconds)
    pub mediator_settle_ms: u64,

    /// Defaults for `generate`
    pub key_kind: KeyKind,
    pub touch_policy: TouchPolicy,
    pub key_expiry: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            gnupg_home: Self::default_gnupg_home(),
            gpg_binary: PathBuf::from("gpg"),
            gpgconf_binary: PathBuf::from("gpgconf"),
            gpg_connect_agent_binary: PathBuf::from("gpg-connect-agent"),
            ykman_binary: PathBuf::from("ykman"),
            log_dir: Self::default_data_dir().join("logs"),
            backup_dir: Self::default_data_dir().join("backups"),
            transfer_timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
            command_timeout_secs: 60,
            stub_size_threshold: DEFAULT_STUB_THRESHOLD,
            retry: RetryPolicy::default(),
            mediator_settle_ms: 2000,
            key_kind: KeyKind::default(),
            touch_policy: TouchPolicy::default(),
            key_expiry: "2y".to_string(),
        }
    }
}

impl ProvisionConfig {
    /// `GNUPGHOME` if set, otherwise `~/.gnupg`
    fn default_gnupg_home() -> PathBuf {
        std::env::var_os("GNUPGHOME")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".gnupg")))
            .unwrap_or_else(|| PathBuf::from(".gnupg"))
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keyward")
    }

    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keyward")
            .join("config.json")
    }

    /// Resolve the config path from an explicit flag, the environment or the default
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(Self::default_path)
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ProvisionError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that would defeat the workflow's guarantees
    pub fn validate(&self) -> Result<()> {
        if self.transfer_timeout_secs == 0 {
            return Err(ProvisionError::Config(
                "transfer_timeout_secs must be positive".to_string(),
            ));
        }
        if self.stub_size_threshold == 0 {
            return Err(ProvisionError::Config(
                "stub_size_threshold must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ProvisionError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir)?;
        std::fs::create_dir_all(&self.backup_dir)?;
        Ok(())
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn mediator_settle(&self) -> Duration {
        Duration::from_millis(self.mediator_settle_ms)
    }

    /// Host key store scanned for leftover private keys
    pub fn private_keys_dir(&self) -> PathBuf {
        self.gnupg_home.join("private-keys-v1.d")
    }
}
