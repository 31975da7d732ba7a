//! Source adapters
//!
//! Raw text comes from a `TextSource` (a command or a log file); the parsers
//! in `wg` and `openvpn` turn it into typed records. A missing command or
//! file is a normal state: it yields an empty, successful read.

pub mod client_map;
pub mod openvpn;
pub mod wg;

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;
use tally_common::{EntityKey, Result, TallyError};
use tracing::debug;

/// How a read ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Ok,
    /// Command or file absent; nothing to account
    Unavailable(String),
    /// Source present but the read itself failed
    Failed(String),
}

impl SourceStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, SourceStatus::Ok)
    }
}

/// Parsed records plus diagnostics
#[derive(Debug, Clone)]
pub struct SourceOutput<T> {
    pub records: Vec<T>,
    /// Malformed records dropped from the batch
    pub skipped: usize,
    /// Keys of dropped records whose identity was still readable
    pub skipped_keys: Vec<EntityKey>,
    pub status: SourceStatus,
}

impl<T> SourceOutput<T> {
    pub fn ok(records: Vec<T>, skipped: usize, skipped_keys: Vec<EntityKey>) -> Self {
        Self {
            records,
            skipped,
            skipped_keys,
            status: SourceStatus::Ok,
        }
    }
}

/// Fetch raw text and map the fetch error onto a status. The caller parses
/// the text only when a payload came back.
pub fn fetch_payload(source: &dyn TextSource) -> std::result::Result<String, SourceStatus> {
    match source.fetch() {
        Ok(text) => Ok(text),
        Err(TallyError::SourceUnavailable(reason)) => {
            debug!("{} unavailable: {}", source.name(), reason);
            Err(SourceStatus::Unavailable(reason))
        }
        Err(e) => Err(SourceStatus::Failed(e.to_string())),
    }
}

/// Something that produces raw status text
pub trait TextSource: Send {
    /// Label for logs
    fn name(&self) -> String;

    /// Fetch the current payload; `SourceUnavailable` when absent
    fn fetch(&self) -> Result<String>;
}

/// Runs an external command and captures stdout
pub struct CommandSource {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl TextSource for CommandSource {
    fn name(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }

    fn fetch(&self) -> Result<String> {
        let output = match Command::new(&self.program).args(&self.args).output() {
            Ok(out) => out,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TallyError::SourceUnavailable(format!(
                    "{} not found",
                    self.program.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TallyError::Io(std::io::Error::other(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            ))));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Reads a whole file
pub struct FileSource {
    pub path: PathBuf,
}

impl TextSource for FileSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn fetch(&self) -> Result<String> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(TallyError::SourceUnavailable(
                format!("{} not found", self.path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fixed payload, swappable at runtime (tests and dry runs)
#[derive(Clone, Default)]
pub struct StaticSource {
    payload: std::sync::Arc<std::sync::Mutex<Option<String>>>,
}

impl StaticSource {
    pub fn new(payload: impl Into<String>) -> Self {
        let source = Self::default();
        source.set(payload);
        source
    }

    /// Source that reports itself as absent
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn set(&self, payload: impl Into<String>) {
        if let Ok(mut slot) = self.payload.lock() {
            *slot = Some(payload.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.payload.lock() {
            *slot = None;
        }
    }
}

impl TextSource for StaticSource {
    fn name(&self) -> String {
        "static".to_string()
    }

    fn fetch(&self) -> Result<String> {
        let slot = self
            .payload
            .lock()
            .map_err(|_| TallyError::SourceUnavailable("static source poisoned".into()))?;
        slot.clone()
            .ok_or_else(|| TallyError::SourceUnavailable("no payload".into()))
    }
}
