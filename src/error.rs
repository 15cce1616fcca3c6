//! Error types for the RCP update engine

use thiserror::Error;

/// Errors surfaced by the download, parse, slot and flashing paths.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Malformed image directory, manifest, or bad parameter
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation called outside its required state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Missing manifest, version file, or flash image
    #[error("not found: {0}")]
    NotFound(String),

    /// Allocation failure (session arena full)
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Attached chip does not match the configured target
    #[error("unsupported chip: expected {expected}, found {found}")]
    UnsupportedChip { expected: String, found: String },

    /// Generic network/protocol/write failure
    #[error("{0}")]
    Fail(String),

    /// Flash-file retries exhausted. The target may be half-flashed; the
    /// caller must not retry automatically, operator intervention required.
    #[error("flashing failed beyond recovery: {0}")]
    FlashFatal(String),

    /// Filesystem I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// True for the fail-stop flashing outcome that must not be auto-retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UpdateError::FlashFatal(_))
    }
}

pub type Result<T, E = UpdateError> = core::result::Result<T, E>;
