//! Error taxonomy for the download engine (spec.md §7).

use thiserror::Error;

/// Errors produced anywhere inside the download engine.
///
/// Each variant corresponds to a row of the error taxonomy table: callers
/// that need to decide whether a failure is retryable, fatal-to-the-asset, or
/// fatal-to-the-run should match on the variant rather than the message.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("asset not found")]
    NotFound,

    #[error("{path} already exists")]
    AlreadyExists { path: String },

    #[error("transient HTTP error (status {status})")]
    TransientHttp { status: u16 },

    #[error("HTTP error (status {status}): {message}")]
    PermanentHttp { status: u16, message: String },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("download workspace for {path} is locked by another process")]
    LockBusy { path: String },

    #[error("size {size} exceeds the 5 TiB maximum object size")]
    SizeTooLarge { size: u64 },

    #[error("refusing to refresh {path}: inside a git-annex repository")]
    AnnexRefreshForbidden { path: String },

    #[error("multipart ETag is incomplete: collected {collected} of {expected} parts")]
    Incomplete { collected: usize, expected: usize },

    #[error("part {part} was already submitted")]
    DuplicatePart { part: u32 },

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{message}")]
    Other { message: String },
}

impl From<anyhow::Error> for EngineError {
    fn from(error: anyhow::Error) -> Self {
        EngineError::Other {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Other {
            message: format!("checksum manifest: {error}"),
        }
    }
}

impl EngineError {
    /// Whether this failure should be retried by [`crate::engine::file_downloader`]'s
    /// transfer loop (spec.md §4.4 rule 4: `{400} ∪ RETRY_STATUSES`).
    pub fn is_retryable_http(&self) -> bool {
        match self {
            EngineError::TransientHttp { status } => {
                *status == 400 || crate::engine::archive::RETRY_STATUSES.contains(status)
            }
            _ => false,
        }
    }

    pub fn exit_code(&self) -> exitcode::ExitCode {
        match self {
            EngineError::NotFound => exitcode::DATAERR,
            EngineError::AlreadyExists { .. } => exitcode::CANTCREAT,
            EngineError::TransientHttp { .. } | EngineError::PermanentHttp { .. } => {
                exitcode::UNAVAILABLE
            }
            EngineError::ChecksumMismatch { .. } => exitcode::DATAERR,
            EngineError::LockBusy { .. } => exitcode::TEMPFAIL,
            EngineError::SizeTooLarge { .. } => exitcode::DATAERR,
            EngineError::AnnexRefreshForbidden { .. } => exitcode::USAGE,
            EngineError::Incomplete { .. } | EngineError::DuplicatePart { .. } => {
                exitcode::SOFTWARE
            }
            EngineError::Io(_) => exitcode::IOERR,
            EngineError::Network(_) => exitcode::UNAVAILABLE,
            EngineError::Other { .. } => exitcode::SOFTWARE,
        }
    }
}
