//! Scripted conversations with interactive tools
//!
//! A [`DialogueDriver`] waits for output matching one of several prompts and
//! answers it. Output is normalized with [`strip_ansi`] before matching, so
//! prompts are found regardless of the control sequences around them.

pub mod pty;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use keyward_core::Fingerprint;
use regex::Regex;

use crate::error::{ProvisionError, Result};
use crate::health::FailureSignature;

pub use pty::{PtyDialogue, PtyDialogueFactory};

/// A named output pattern
#[derive(Clone)]
pub struct Prompt {
    name: &'static str,
    regex: Regex,
}

impl Prompt {
    pub fn new(name: &'static str, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| ProvisionError::Dialogue(format!("bad prompt pattern {}: {}", name, e)))?;
        Ok(Self { name, regex })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Byte range of the first match in `text`
    pub fn find(&self, text: &str) -> Option<(usize, usize)> {
        self.regex.find(text).map(|m| (m.start(), m.end()))
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prompt({}: /{}/)", self.name, self.regex.as_str())
    }
}

/// Prompts of the `--edit-key` key-to-card conversation
#[derive(Clone, Debug)]
pub struct EditKeyPrompts {
    /// Ready prompt of the key editor
    pub ready: Prompt,
    /// Slot chooser after `keytocard`
    pub slot_selection: Prompt,
    /// Admin PIN request line, including the loopback passphrase form
    ///
    /// Anchored to a whole `...:` line so the "Please enter the Admin PIN"
    /// banner never counts as a prompt of its own.
    pub admin_pin: Prompt,
    /// Overwrite confirmation when the slot already holds a key
    pub replace: Prompt,
    /// Confirmation to save changes on quit
    pub save: Prompt,
    /// Card refused the admin PIN
    pub pin_rejected: Prompt,
    /// Mediator lost the card
    pub communication: Prompt,
    /// Any other error reported by the editor
    pub error: Prompt,
}

impl EditKeyPrompts {
    pub fn new() -> Result<Self> {
        Ok(Self {
            ready: Prompt::new("ready prompt", r"(?m)^\s*gpg>\s*$")?,
            slot_selection: Prompt::new("slot selection", r"(?i)your selection\?\s*$")?,
            admin_pin: Prompt::new(
                "admin PIN prompt",
                r"(?im)^[ \t]*(admin pin|enter passphrase|passphrase)[ \t]*:[ \t\r]*$",
            )?,
            replace: Prompt::new("replace confirmation", r"(?i)replace existing key\?\s*\(y/n\)\s*$")?,
            save: Prompt::new("save confirmation", r"(?i)save changes\?\s*\(y/n\)\s*$")?,
            pin_rejected: Prompt::new(
                "PIN rejection",
                r"(?i)(bad pin|wrong pin|pin blocked|bad passphrase)",
            )?,
            communication: Prompt::new(
                "card failure",
                r"(?i)(broken pipe|no card|card error|card not present|no such device)",
            )?,
            error: Prompt::new(
                "editor error",
                r"(?i)(keytocard failed|key not found|no secret key|secret key not available|invalid command)[^\n]*",
            )?,
        })
    }
}

/// Scripted conversation with one interactive process
#[async_trait]
pub trait DialogueDriver: Send {
    /// Wait until one of `prompts` matches; return its index and the text up to the match end
    async fn expect_any(&mut self, prompts: &[&Prompt], timeout: Duration) -> Result<(usize, String)>;

    /// Wait for a single prompt
    async fn expect(&mut self, prompt: &Prompt, timeout: Duration) -> Result<String> {
        let (_, text) = self.expect_any(&[prompt], timeout).await?;
        Ok(text)
    }

    /// Send one line of input
    async fn send(&mut self, line: &str) -> Result<()>;

    /// Send a secret line; later output is scrubbed of the value
    async fn send_secret(&mut self, secret: &str) -> Result<()>;

    /// End the conversation and reap the process
    async fn close(&mut self) -> Result<()>;
}

/// Opens key-editor dialogues
#[async_trait]
pub trait DialogueFactory: Send + Sync {
    /// Start an interactive key-editing session for `master`
    async fn open_edit_key(&self, master: &Fingerprint) -> Result<Box<dyn DialogueDriver>>;
}

/// Earliest match among `prompts`; ties go to the earlier prompt
///
/// Returns the prompt index and the end of its match.
pub fn first_match(prompts: &[&Prompt], text: &str) -> Option<(usize, usize)> {
    prompts
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.find(text).map(|(start, end)| (start, i, end)))
        .min_by_key(|(start, i, _)| (*start, *i))
        .map(|(_, i, end)| (i, end))
}

/// Error for output that matched nothing the script expected
///
/// Output carrying a mediator failure signature is a communication failure,
/// which the caller may cure with a restart.
pub fn unexpected(context: &str, transcript: &str) -> ProvisionError {
    let tail = transcript_tail(transcript);
    match FailureSignature::detect(transcript) {
        Some(signature) => ProvisionError::HardwareCommunication(format!(
            "{} ({}): {}",
            context, signature, tail
        )),
        None => ProvisionError::Dialogue(format!("{}: {}", context, tail)),
    }
}

/// Last few lines of a transcript for diagnostics
pub fn transcript_tail(transcript: &str) -> String {
    let lines: Vec<&str> = transcript
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(6);
    lines[start..].join(" | ")
}

/// Remove terminal control sequences and carriage returns
pub fn strip_ansi(input: &str) -> String {
    AnsiStripper::default().feed(input)
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
enum EscapeState {
    #[default]
    Text,
    Escape,
    Csi,
    Osc,
    OscEscape,
}

/// Incremental [`strip_ansi`] for output arriving in chunks
///
/// A sequence split across two chunks is still removed whole.
#[derive(Debug, Default)]
pub struct AnsiStripper {
    state: EscapeState,
}

impl AnsiStripper {
    pub fn feed(&mut self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        for c in input.chars() {
            self.state = match self.state {
                EscapeState::Text => match c {
                    '\x1b' => EscapeState::Escape,
                    '\r' | '\x07' | '\x08' => EscapeState::Text,
                    _ => {
                        out.push(c);
                        EscapeState::Text
                    }
                },
                EscapeState::Escape => match c {
                    '[' => EscapeState::Csi,
                    ']' => EscapeState::Osc,
                    // Two-byte sequences such as ESC = or ESC 7
                    _ => EscapeState::Text,
                },
                EscapeState::Csi => {
                    if ('\x40'..='\x7e').contains(&c) {
                        EscapeState::Text
                    } else {
                        EscapeState::Csi
                    }
                }
                EscapeState::Osc => match c {
                    '\x07' => EscapeState::Text,
                    '\x1b' => EscapeState::OscEscape,
                    _ => EscapeState::Osc,
                },
                EscapeState::OscEscape => EscapeState::Text,
            };
        }
        out
    }
}
