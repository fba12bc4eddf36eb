//! Run logging
//!
//! Every run writes a timestamped log file next to the stderr output. Both
//! sinks go through [`RedactingMakeWriter`], so a registered PIN is replaced
//! before any byte leaves the process.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use keyward_core::Redactor;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{ProvisionError, Result};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "keyward=info";

/// Writer that scrubs registered secrets from each buffer it receives
pub struct RedactingWriter<W> {
    inner: W,
    redactor: Redactor,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // fmt layers hand over one formatted event per call
        let scrubbed = self.redactor.redact_bytes(buf);
        self.inner.write_all(&scrubbed)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` adapter applying a [`Redactor`] to another writer
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactor: Redactor,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M, redactor: Redactor) -> Self {
        Self { inner, redactor }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for RedactingMakeWriter<M> {
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            redactor: self.redactor.clone(),
        }
    }
}

/// Path of the log file for a run started now
pub fn run_log_path(log_dir: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    log_dir.join(format!("keyward-{}.log", stamp))
}

/// Install the global subscriber: stderr plus a per-run file, both redacted
///
/// Returns the path of the run log.
pub fn init(log_dir: &Path, redactor: &Redactor) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let path = run_log_path(log_dir);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(RedactingMakeWriter::new(io::stderr, redactor.clone())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(RedactingMakeWriter::new(Mutex::new(file), redactor.clone())),
        )
        .try_init()
        .map_err(|e| ProvisionError::Config(format!("logging already initialized: {}", e)))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_scrubs_registered_pin() {
        let redactor = Redactor::new();
        let buffer = Buffer::default();
        let make = RedactingMakeWriter::new(
            {
                let buffer = buffer.clone();
                move || buffer.clone()
            },
            redactor.clone(),
        );

        let _guard = redactor.register("135798");
        make.make_writer()
            .write_all(b"admin PIN is 135798\n")
            .unwrap();

        let written = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written, "admin PIN is [REDACTED]\n");
    }

    #[test]
    fn test_subscriber_output_is_redacted() {
        let redactor = Redactor::new();
        let buffer = Buffer::default();
        let writer = {
            let buffer = buffer.clone();
            move || buffer.clone()
        };
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(RedactingMakeWriter::new(writer, redactor.clone()))
            .finish();

        let _pin = redactor.register("135798");
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(pin = "135798", "sending 135798");
        });

        let written = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(!written.contains("135798"));
        assert!(written.contains("[REDACTED]"));
    }

    #[test]
    fn test_run_log_name() {
        let path = run_log_path(Path::new("/tmp/logs"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("keyward-"));
        assert!(name.ends_with("Z.log"));
    }
}
