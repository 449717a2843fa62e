//! Per-record error taxonomy and the plain-text error log.
//!
//! Nothing in here aborts a run. A [`RecordError`] is fatal to one record
//! only: the merge logs it, counts it under its [`ErrorKind`], and moves on.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

/// Characters of raw payload copied into the error log.
const RAW_EXCERPT_CHARS: usize = 200;

/// Failure to parse or build an [`Identity`](crate::identity::Identity).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity '{0}' is missing the '|' separator")]
    MissingSeparator(String),
    #[error("identity '{0}' has no valid non-negative index")]
    InvalidIndex(String),
    #[error("identity path is empty")]
    EmptyPath,
    #[error("path '{0}' contains the reserved '|' separator")]
    ReservedSeparator(String),
}

/// Category of a per-record failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    FormatError,
    UpstreamError,
    ExtractionFailed,
    SourceMissing,
    IndexOutOfBounds,
    DecodeError,
    InvalidPayload,
    DuplicateIdentity,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FormatError => "FormatError",
            ErrorKind::UpstreamError => "UpstreamError",
            ErrorKind::ExtractionFailed => "ExtractionFailed",
            ErrorKind::SourceMissing => "SourceMissing",
            ErrorKind::IndexOutOfBounds => "IndexOutOfBounds",
            ErrorKind::DecodeError => "DecodeError",
            ErrorKind::InvalidPayload => "InvalidPayload",
            ErrorKind::DuplicateIdentity => "DuplicateIdentity",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure attributed to one result record.
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct RecordError {
    pub kind: ErrorKind,
    pub message: String,
    /// Raw text worth keeping for a rerun (model output, offending line).
    pub raw: Option<String>,
}

impl RecordError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raw: None,
        }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }
}

impl From<IdentityError> for RecordError {
    fn from(e: IdentityError) -> Self {
        RecordError::new(ErrorKind::FormatError, e.to_string())
    }
}

/// Writer for the per-run error log.
///
/// Each failure becomes one block:
///
/// ```text
/// [IndexOutOfBounds] ID: guide.json|5
/// Message: index 5 >= length 3
/// --------------------------------------------------
/// ```
pub struct ErrorLog {
    out: Box<dyn Write>,
}

impl ErrorLog {
    /// Create (truncate) the log file, creating parent directories.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create error log: {}", path.display()))?;
        Ok(Self {
            out: Box::new(BufWriter::new(file)),
        })
    }

    /// Log into an arbitrary writer.
    pub fn from_writer(out: impl Write + 'static) -> Self {
        Self { out: Box::new(out) }
    }

    pub fn record(&mut self, id: &str, err: &RecordError) -> Result<()> {
        writeln!(self.out, "[{}] ID: {}", err.kind, id)?;
        writeln!(self.out, "Message: {}", err.message)?;
        if let Some(raw) = err.raw.as_deref().filter(|r| !r.is_empty()) {
            writeln!(self.out, "Raw Data: {}...", excerpt(raw))?;
        }
        writeln!(self.out, "{}", "-".repeat(50))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// First [`RAW_EXCERPT_CHARS`] characters of `raw`, never splitting a char.
pub fn excerpt(raw: &str) -> &str {
    match raw.char_indices().nth(RAW_EXCERPT_CHARS) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
