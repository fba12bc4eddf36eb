//! Startup checks for the external tools every workflow needs

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};

/// A tool and where it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLocation {
    pub name: &'static str,
    pub path: PathBuf,
}

/// Tools named by the configuration, in the order they are checked
pub fn required_tools(config: &ProvisionConfig) -> [(&'static str, &Path); 4] {
    [
        ("gpg", config.gpg_binary.as_path()),
        ("gpgconf", config.gpgconf_binary.as_path()),
        ("gpg-connect-agent", config.gpg_connect_agent_binary.as_path()),
        ("ykman", config.ykman_binary.as_path()),
    ]
}

/// Locate every required tool; any missing one is a precondition failure
pub fn check_tools(config: &ProvisionConfig) -> Result<Vec<ToolLocation>> {
    let mut found = Vec::new();
    let mut missing = Vec::new();
    for (name, program) in required_tools(config) {
        match crate::process::find_executable(program) {
            Some(path) => {
                debug!(tool = name, path = %path.display(), "found");
                found.push(ToolLocation { name, path });
            }
            None => missing.push(format!("{} ({})", name, program.display())),
        }
    }
    if !missing.is_empty() {
        return Err(ProvisionError::Precondition(format!(
            "required tools not found: {}",
            missing.join(", ")
        )));
    }
    info!("All {} external tools present", found.len());
    Ok(found)
}
