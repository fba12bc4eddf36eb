//! Mediator health management
//!
//! All host-to-token traffic goes through gpg-agent and scdaemon. Both are
//! known to wedge after a card reset or a key transfer, answering with a
//! broken pipe or a card error until restarted. [`HealthManager`] probes
//! the mediator and restarts it, bounded by a [`RestartBudget`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyward_core::{RestartBudget, RetryPolicy};
use tracing::{info, warn};

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::process::{self, CommandLine};

/// Output fragments that mean the mediator lost the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignature {
    BrokenPipe,
    NoCard,
    CardError,
    CardNotPresent,
    NoSuchDevice,
}

impl FailureSignature {
    pub const ALL: [FailureSignature; 5] = [
        FailureSignature::BrokenPipe,
        FailureSignature::NoCard,
        FailureSignature::CardError,
        FailureSignature::CardNotPresent,
        FailureSignature::NoSuchDevice,
    ];

    fn needle(self) -> &'static str {
        match self {
            FailureSignature::BrokenPipe => "broken pipe",
            FailureSignature::NoCard => "no card",
            FailureSignature::CardError => "card error",
            FailureSignature::CardNotPresent => "card not present",
            FailureSignature::NoSuchDevice => "no such device",
        }
    }

    /// First signature found in `text`, case-insensitive
    pub fn detect(text: &str) -> Option<Self> {
        let lower = text.to_ascii_lowercase();
        Self::ALL.into_iter().find(|sig| lower.contains(sig.needle()))
    }
}

impl fmt::Display for FailureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.needle())
    }
}

/// Control surface of the hardware-access mediator
#[async_trait]
pub trait Mediator: Send + Sync {
    /// Ask the mediator for the card serial; returns the raw answer
    async fn probe(&self) -> Result<String>;

    /// Stop the mediator processes
    async fn terminate(&self) -> Result<()>;

    /// Start the mediator again
    async fn launch(&self) -> Result<()>;
}

/// gpg-agent and scdaemon controlled through `gpgconf`
pub struct GpgAgentMediator {
    gpgconf: PathBuf,
    connect_agent: PathBuf,
    gnupg_home: PathBuf,
    timeout: Duration,
}

impl GpgAgentMediator {
    pub fn new(config: &ProvisionConfig) -> Self {
        Self {
            gpgconf: config.gpgconf_binary.clone(),
            connect_agent: config.gpg_connect_agent_binary.clone(),
            gnupg_home: config.gnupg_home.clone(),
            timeout: config.command_timeout(),
        }
    }

    fn gpgconf(&self) -> CommandLine {
        CommandLine::new(&self.gpgconf).env("GNUPGHOME", &self.gnupg_home)
    }
}

#[async_trait]
impl Mediator for GpgAgentMediator {
    async fn probe(&self) -> Result<String> {
        let cmd = CommandLine::new(&self.connect_agent)
            .env("GNUPGHOME", &self.gnupg_home)
            .args(["scd serialno", "/bye"]);
        let output = process::run(&cmd, None, self.timeout).await?;
        Ok(output.combined())
    }

    async fn terminate(&self) -> Result<()> {
        for component in ["scdaemon", "gpg-agent"] {
            let cmd = self.gpgconf().args(["--kill", component]);
            let output = process::run(&cmd, None, self.timeout).await?;
            if !output.success {
                warn!("gpgconf --kill {} failed: {}", component, output.stderr.trim());
            }
        }
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        let cmd = self.gpgconf().args(["--launch", "gpg-agent"]);
        let output = process::run(&cmd, None, self.timeout).await?;
        if !output.success {
            return Err(ProvisionError::HardwareCommunication(format!(
                "could not launch gpg-agent: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Outcome of a successful health check
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Restarts performed by this check
    pub restarts: u32,
    /// Raw probe answer from the healthy mediator
    pub probe_output: String,
}

/// Probes the mediator and restarts it within a bounded budget
#[derive(Clone)]
pub struct HealthManager {
    mediator: Arc<dyn Mediator>,
    policy: RetryPolicy,
    settle: Duration,
}

impl HealthManager {
    pub fn new(mediator: Arc<dyn Mediator>, policy: RetryPolicy, settle: Duration) -> Self {
        Self {
            mediator,
            policy,
            settle,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Check health with a fresh budget from the policy
    pub async fn ensure_healthy(&self) -> Result<HealthReport> {
        let mut budget = self.policy.budget();
        self.ensure_healthy_with(&mut budget).await
    }

    /// Check health, drawing restarts from a caller-owned budget
    pub async fn ensure_healthy_with(&self, budget: &mut RestartBudget) -> Result<HealthReport> {
        let mut restarts = 0;
        loop {
            let answer = self.mediator.probe().await?;
            let Some(signature) = FailureSignature::detect(&answer) else {
                if restarts > 0 {
                    info!("Mediator healthy after {} restart(s)", restarts);
                }
                return Ok(HealthReport {
                    restarts,
                    probe_output: answer,
                });
            };

            if !budget.try_consume() {
                return Err(ProvisionError::HardwareCommunication(format!(
                    "mediator still reports '{}' after {} restart(s)",
                    signature,
                    budget.used()
                )));
            }
            warn!(
                "Mediator reports '{}', restarting (attempt {} of {})",
                signature,
                budget.used(),
                self.policy.max_attempts
            );
            self.restart_mediator().await?;
            restarts += 1;
        }
    }

    /// Terminate and relaunch the mediator with settle pauses
    pub async fn restart_mediator(&self) -> Result<()> {
        self.mediator.terminate().await?;
        tokio::time::sleep(self.settle).await;
        self.mediator.launch().await?;
        tokio::time::sleep(self.settle).await;
        info!("Mediator restarted");
        Ok(())
    }
}
