//! Keyward - Provision OpenPGP identities onto hardware tokens
//!
//! Exit status: 0 on success or when the operator cancels, 2 when a
//! precondition is not met, 3 when the transfer could not be verified and
//! 1 for every other failure.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use keyward_core::{KeyKind, Redactor, TouchPolicy, UserId};
use tracing::info;

use keyward_provision::{
    logging, preflight, Collaborators, ErrorClass, ModeChoice, ModeParams, ProvisionConfig,
    ProvisionError, Workflow,
};

#[derive(Parser)]
#[command(name = "keyward")]
#[command(about = "Move OpenPGP subkeys onto a hardware token, verify and back up", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: $KEYWARD_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// GnuPG home directory
    #[arg(long, global = true)]
    gnupg_home: Option<PathBuf>,

    /// Directory for run logs
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Directory backups are written under
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    /// Answer yes to reset confirmations
    #[arg(short, long, global = true)]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity and move its subkeys onto the token
    Generate {
        /// Name for the user id
        #[arg(long)]
        name: String,

        /// Email address for the user id
        #[arg(long)]
        email: String,

        /// Key algorithm (ed25519 or rsa4096)
        #[arg(long)]
        key_kind: Option<KeyKind>,

        /// Touch policy for all slots (off, on, fixed, cached, cached-fixed)
        #[arg(long)]
        touch_policy: Option<TouchPolicy>,

        /// Key expiry, e.g. 2y
        #[arg(long)]
        expiry: Option<String>,
    },

    /// Load the subkeys of an existing backup onto a token
    Load {
        /// Backup directory written by an earlier run
        #[arg(long)]
        backup: PathBuf,
    },

    /// Verify the token and back up the identity on it
    Backup,

    /// Show card status and slot occupancy
    Status,

    /// Restart gpg-agent and scdaemon
    RestartAgent,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let redactor = Redactor::new();
    let code = match run(cli, &redactor).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", redactor.redact(&format!("Error: {:#}", e)));
            match e.downcast_ref::<ProvisionError>().map(ProvisionError::class) {
                Some(ErrorClass::Precondition) => 2,
                Some(ErrorClass::Cancelled) => 0,
                _ => 1,
            }
        }
    };
    std::process::exit(code);
}

fn load_config(cli: &Cli) -> anyhow::Result<ProvisionConfig> {
    let path = ProvisionConfig::resolve_path(cli.config.as_deref());
    let mut config = ProvisionConfig::load_or_default(&path)
        .with_context(|| format!("loading config {}", path.display()))?;
    if let Some(dir) = &cli.gnupg_home {
        config.gnupg_home = dir.clone();
    }
    if let Some(dir) = &cli.log_dir {
        config.log_dir = dir.clone();
    }
    if let Some(dir) = &cli.backup_dir {
        config.backup_dir = dir.clone();
    }
    config.validate()?;
    config.ensure_directories()?;
    Ok(config)
}

async fn run(cli: Cli, redactor: &Redactor) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    let log_path = logging::init(&config.log_dir, redactor)?;
    info!("keyward v{} (log {})", env!("CARGO_PKG_VERSION"), log_path.display());

    preflight::check_tools(&config)?;
    let collaborators = Collaborators::system(&config, cli.yes);
    let operator = collaborators.operator.clone();
    let workflow = Workflow::new(&config, collaborators, redactor.clone())?;

    let params = match cli.command {
        Some(Commands::Status) => {
            workflow.health().ensure_healthy().await?;
            let (device, raw) = workflow.read_device().await?;
            println!("{}", raw.trim_end());
            println!();
            println!("{}", device.summary());
            for (slot, state) in device.slots.iter() {
                let shown = match state.fingerprint() {
                    Some(fpr) => fpr.to_string(),
                    None if state.is_occupied() => "occupied".to_string(),
                    None => "empty".to_string(),
                };
                println!("  {:<15} {}", slot, shown);
            }
            return Ok(0);
        }
        Some(Commands::RestartAgent) => {
            workflow.health().restart_mediator().await?;
            let report = workflow.health().ensure_healthy().await?;
            println!("Mediator restarted ({} extra restart(s) needed)", report.restarts);
            return Ok(0);
        }
        Some(Commands::Generate {
            name,
            email,
            key_kind,
            touch_policy,
            expiry,
        }) => ModeParams::Generate {
            user_id: UserId::new(&name, &email).map_err(ProvisionError::from)?,
            key_kind: key_kind.unwrap_or(config.key_kind),
            touch_policy: touch_policy.unwrap_or(config.touch_policy),
            expiry: expiry.unwrap_or_else(|| config.key_expiry.clone()),
        },
        Some(Commands::Load { backup }) => ModeParams::Load { backup },
        Some(Commands::Backup) => ModeParams::Backup,
        None => match operator.select_mode().await? {
            ModeChoice::Generate => {
                let name = operator.read_line("Name: ").await?;
                let email = operator.read_line("Email: ").await?;
                ModeParams::Generate {
                    user_id: UserId::new(&name, &email).map_err(ProvisionError::from)?,
                    key_kind: config.key_kind,
                    touch_policy: config.touch_policy,
                    expiry: config.key_expiry.clone(),
                }
            }
            ModeChoice::Load => {
                let backup = operator.read_line("Backup directory: ").await?;
                ModeParams::Load {
                    backup: PathBuf::from(backup),
                }
            }
            ModeChoice::Backup => ModeParams::Backup,
            ModeChoice::Quit => return Ok(0),
        },
    };

    let result = workflow.run(params).await;
    if let Some(diagnostic) = result.diagnostic() {
        eprintln!("{}", redactor.redact(&diagnostic));
        eprintln!("Full log: {}", log_path.display());
    }
    if let (Some(identity), Some(backup)) = (&result.identity, &result.backup) {
        println!("Identity {} is on the token", identity.master.fingerprint);
        println!("Backup: {}", backup.dir.display());
    }
    Ok(result.exit_code())
}
