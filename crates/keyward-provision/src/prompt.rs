//! Operator interaction
//!
//! PINs are read with echo off through crossterm raw mode; everything else
//! is a plain line from stdin. All prompts go to stderr so stdout stays
//! free for reports.

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use keyward_core::Redactor;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{ProvisionError, Result};
use crate::secret::{Pin, PinKind};

/// Attempts allowed to type matching PIN and confirmation
pub const PIN_ENTRY_ATTEMPTS: u32 = 3;

/// Workflow chosen interactively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChoice {
    Generate,
    Load,
    Backup,
    Quit,
}

/// The person at the keyboard
#[async_trait]
pub trait Operator: Send + Sync {
    /// Read a secret without echo
    async fn read_secret(&self, prompt: &str) -> Result<Zeroizing<String>>;

    /// Read one line of plain text
    async fn read_line(&self, prompt: &str) -> Result<String>;

    /// Ask a yes/no question; false means no
    async fn confirm(&self, question: &str) -> Result<bool>;

    /// Ask which workflow to run
    async fn select_mode(&self) -> Result<ModeChoice>;

    /// Show a message that needs no answer, such as a touch request
    fn notify(&self, message: &str);
}

/// Ask for a new PIN twice until both entries agree and the PIN is valid
pub async fn collect_new_pin(
    operator: &dyn Operator,
    kind: PinKind,
    redactor: &Redactor,
) -> Result<Pin> {
    for attempt in 1..=PIN_ENTRY_ATTEMPTS {
        let first = operator
            .read_secret(&format!("New {} ({}+ characters): ", kind, kind.min_len()))
            .await?;
        let first = match Pin::new(kind, &first, redactor) {
            Ok(pin) => pin,
            Err(e) => {
                operator.notify(&format!("{} (attempt {} of {})", e, attempt, PIN_ENTRY_ATTEMPTS));
                continue;
            }
        };
        let second = operator.read_secret(&format!("Repeat {}: ", kind)).await?;
        let matches = Pin::new(kind, &second, redactor)
            .map(|second| second.matches(&first))
            .unwrap_or(false);
        if matches {
            return Ok(first);
        }
        warn!("{} entries did not match (attempt {} of {})", kind, attempt, PIN_ENTRY_ATTEMPTS);
        operator.notify(&format!(
            "Entries did not match (attempt {} of {})",
            attempt, PIN_ENTRY_ATTEMPTS
        ));
    }
    Err(ProvisionError::Pin(format!(
        "{} not confirmed after {} attempts",
        kind, PIN_ENTRY_ATTEMPTS
    )))
}

/// Ask for an existing PIN once
pub async fn collect_existing_pin(
    operator: &dyn Operator,
    kind: PinKind,
    redactor: &Redactor,
) -> Result<Pin> {
    let value = operator.read_secret(&format!("Current {}: ", kind)).await?;
    Pin::new(kind, &value, redactor)
}

/// Interactive terminal operator
pub struct TerminalOperator {
    assume_yes: bool,
}

impl TerminalOperator {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

fn read_masked(prompt: &str) -> Result<Zeroizing<String>> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;

    enable_raw_mode()?;
    let result = read_masked_raw(&mut stderr);
    // Always leave raw mode, even when reading failed
    let restored = disable_raw_mode();
    writeln!(stderr)?;
    restored?;
    result
}

fn read_masked_raw(stderr: &mut io::Stderr) -> Result<Zeroizing<String>> {
    let mut value = Zeroizing::new(String::new());
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(value),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(ProvisionError::Cancelled)
            }
            KeyCode::Esc => return Err(ProvisionError::Cancelled),
            KeyCode::Backspace => {
                if value.pop().is_some() {
                    write!(stderr, "\x08 \x08")?;
                }
            }
            KeyCode::Char(c) => {
                value.push(c);
                write!(stderr, "*")?;
            }
            _ => {}
        }
        stderr.flush()?;
    }
}

fn read_plain_line(prompt: &str) -> Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;
    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        return Err(ProvisionError::Cancelled);
    }
    Ok(line.trim().to_string())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProvisionError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

/// Map a typed answer to a workflow
pub fn parse_mode(answer: &str) -> Option<ModeChoice> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "1" | "g" | "generate" => Some(ModeChoice::Generate),
        "2" | "l" | "load" => Some(ModeChoice::Load),
        "3" | "b" | "backup" => Some(ModeChoice::Backup),
        "q" | "quit" | "exit" => Some(ModeChoice::Quit),
        _ => None,
    }
}

#[async_trait]
impl Operator for TerminalOperator {
    async fn read_secret(&self, prompt: &str) -> Result<Zeroizing<String>> {
        let prompt = prompt.to_string();
        blocking(move || read_masked(&prompt)).await
    }

    async fn read_line(&self, prompt: &str) -> Result<String> {
        let prompt = prompt.to_string();
        blocking(move || read_plain_line(&prompt)).await
    }

    async fn confirm(&self, question: &str) -> Result<bool> {
        if self.assume_yes {
            eprintln!("{} [y/N] y (--yes)", question);
            return Ok(true);
        }
        let answer = self.read_line(&format!("{} [y/N] ", question)).await?;
        Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    async fn select_mode(&self) -> Result<ModeChoice> {
        eprintln!("Select a workflow:");
        eprintln!("  1) generate  new identity, moved onto the token");
        eprintln!("  2) load      existing backup onto a token");
        eprintln!("  3) backup    back up the identity already on the token");
        eprintln!("  q) quit");
        loop {
            let answer = self.read_line("> ").await?;
            if let Some(choice) = parse_mode(&answer) {
                return Ok(choice);
            }
            eprintln!("Unknown choice: {}", answer);
        }
    }

    fn notify(&self, message: &str) {
        eprintln!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedOperator;

    #[tokio::test]
    async fn test_matching_entries_accepted() {
        let redactor = Redactor::new();
        let operator = ScriptedOperator::new().with_secrets(["135798", "135798"]);
        let pin = collect_new_pin(&operator, PinKind::User, &redactor).await.unwrap();
        assert_eq!(pin.expose(), "135798");
    }

    #[tokio::test]
    async fn test_mismatch_reprompts() {
        let redactor = Redactor::new();
        let operator =
            ScriptedOperator::new().with_secrets(["135798", "135799", "246801", "246801"]);
        let pin = collect_new_pin(&operator, PinKind::User, &redactor).await.unwrap();
        assert_eq!(pin.expose(), "246801");
        assert_eq!(operator.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_three_mismatches_fail() {
        let redactor = Redactor::new();
        let operator = ScriptedOperator::new()
            .with_secrets(["135798", "1", "135798", "2", "135798", "3"]);
        let err = collect_new_pin(&operator, PinKind::User, &redactor).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Pin(_)));
    }

    #[tokio::test]
    async fn test_short_pin_uses_an_attempt() {
        let redactor = Redactor::new();
        let operator = ScriptedOperator::new().with_secrets(["123", "13579864", "13579864"]);
        let pin = collect_new_pin(&operator, PinKind::Admin, &redactor).await.unwrap();
        assert_eq!(pin.kind(), PinKind::Admin);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("1"), Some(ModeChoice::Generate));
        assert_eq!(parse_mode(" Load "), Some(ModeChoice::Load));
        assert_eq!(parse_mode("b"), Some(ModeChoice::Backup));
        assert_eq!(parse_mode("q"), Some(ModeChoice::Quit));
        assert_eq!(parse_mode("4"), None);
    }
}
