//! Pseudo-terminal backed dialogue
//!
//! Interactive tools only show their prompts to a terminal. The child runs
//! on a pty with `TERM=dumb`; a reader thread forwards raw output into a
//! channel so waits can be bounded with tokio timers.

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use keyward_core::{Fingerprint, REDACTED};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use super::{first_match, unexpected, AnsiStripper, DialogueDriver, DialogueFactory, Prompt};
use crate::error::{ProvisionError, Result};
use crate::gpg::GpgService;
use crate::process::{CommandLine, ProcessOutput};

const READ_CHUNK: usize = 4096;

/// Dialogue with a child process attached to a pseudo-terminal
pub struct PtyDialogue {
    label: String,
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    stripper: AnsiStripper,
    pending: Vec<u8>,
    buffer: String,
    secrets: Vec<Zeroizing<String>>,
    eof: bool,
}

impl PtyDialogue {
    /// Start `command` on a fresh pty
    pub fn spawn(command: &CommandLine) -> Result<Self> {
        let label = command.label();
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 40,
                cols: 160,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProvisionError::Dialogue(format!("could not open pty: {}", e)))?;

        let mut builder = CommandBuilder::new(&command.program);
        builder.args(&command.args);
        for (key, value) in &command.env {
            builder.env(key, value);
        }
        builder.env("TERM", "dumb");
        builder.env("LC_ALL", "C");

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| ProvisionError::Precondition(format!("could not start {}: {}", label, e)))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProvisionError::Dialogue(format!("pty reader unavailable: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProvisionError::Dialogue(format!("pty writer unavailable: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        debug!(command = %label, "dialogue started");
        Ok(Self {
            label,
            _master: pair.master,
            writer,
            child,
            output: rx,
            stripper: AnsiStripper::default(),
            pending: Vec::new(),
            buffer: String::new(),
            secrets: Vec::new(),
            eof: false,
        })
    }

    /// Decode a raw chunk, carrying an incomplete UTF-8 tail to the next one
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    fn ingest(&mut self, chunk: &[u8]) {
        let text = self.decode(chunk);
        let text = self.stripper.feed(&text);
        self.buffer.push_str(&text);
        for secret in &self.secrets {
            if self.buffer.contains(secret.as_str()) {
                self.buffer = self.buffer.replace(secret.as_str(), REDACTED);
            }
        }
    }

    /// Read the remaining output and wait for the child to exit
    ///
    /// The terminal merges both streams, so everything lands in `stdout`.
    pub async fn finish(&mut self, timeout: Duration) -> Result<ProcessOutput> {
        let deadline = Instant::now() + timeout;
        let overdue = |label: &str| {
            ProvisionError::Service(format!("{} did not finish within {:?}", label, timeout))
        };
        while !self.eof {
            match tokio::time::timeout_at(deadline, self.output.recv()).await {
                Ok(Some(chunk)) => self.ingest(&chunk),
                Ok(None) => self.eof = true,
                Err(_) => {
                    self.child.kill()?;
                    return Err(overdue(&self.label));
                }
            }
        }
        loop {
            if let Some(status) = self.child.try_wait()? {
                debug!(command = %self.label, code = status.exit_code(), "dialogue finished");
                return Ok(ProcessOutput {
                    success: status.success(),
                    code: i32::try_from(status.exit_code()).ok(),
                    stdout: std::mem::take(&mut self.buffer),
                    stderr: String::new(),
                });
            }
            if Instant::now() >= deadline {
                self.child.kill()?;
                return Err(overdue(&self.label));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut data = Zeroizing::new(Vec::with_capacity(line.len() + 1));
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        if let Err(e) = self.writer.write_all(&data).and_then(|_| self.writer.flush()) {
            return Err(unexpected(
                &format!("write to {} failed: {}", self.label, e),
                &self.buffer,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DialogueDriver for PtyDialogue {
    async fn expect_any(&mut self, prompts: &[&Prompt], timeout: Duration) -> Result<(usize, String)> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if let Some((index, end)) = first_match(prompts, &self.buffer) {
                let text: String = self.buffer.drain(..end).collect();
                trace!(prompt = prompts[index].name(), "matched");
                return Ok((index, text));
            }

            let waiting_for = || {
                prompts
                    .iter()
                    .map(|p| p.name())
                    .collect::<Vec<_>>()
                    .join(" or ")
            };

            if self.eof {
                return Err(unexpected(
                    &format!("{} exited while waiting for {}", self.label, waiting_for()),
                    &self.buffer,
                ));
            }

            match tokio::time::timeout_at(deadline, self.output.recv()).await {
                Ok(Some(chunk)) => self.ingest(&chunk),
                Ok(None) => self.eof = true,
                Err(_) => {
                    return Err(ProvisionError::DialogueTimeout {
                        waiting_for: waiting_for(),
                        elapsed: started.elapsed(),
                    })
                }
            }
        }
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.write_line(line)
    }

    async fn send_secret(&mut self, secret: &str) -> Result<()> {
        self.secrets.push(Zeroizing::new(secret.to_string()));
        self.write_line(secret)
    }

    async fn close(&mut self) -> Result<()> {
        for _ in 0..20 {
            if self.child.try_wait()?.is_some() {
                debug!(command = %self.label, "dialogue finished");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        debug!(command = %self.label, "terminating dialogue");
        self.child.kill()?;
        Ok(())
    }
}

impl Drop for PtyDialogue {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
    }
}

/// Opens `gpg --edit-key` dialogues on a pty
pub struct PtyDialogueFactory {
    service: GpgService,
}

impl PtyDialogueFactory {
    pub fn new(service: GpgService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DialogueFactory for PtyDialogueFactory {
    async fn open_edit_key(&self, master: &Fingerprint) -> Result<Box<dyn DialogueDriver>> {
        let dialogue = PtyDialogue::spawn(&self.service.edit_key_command(master))?;
        Ok(Box::new(dialogue))
    }
}
