//! Error types for credstamp
//!
//! Each layer of the time stamp cache has its own small error enum; they all
//! fold into [`StampError`], and every module returns `StampResult<T>`.

use crate::stamp::lock::LockError;
use crate::stamp::secure_dir::DirError;
use crate::stamp::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for credstamp operations
pub type StampResult<T> = Result<T, StampError>;

/// All errors that can occur in credstamp
#[derive(Error, Debug)]
pub enum StampError {
    // Policy errors
    #[error("Time stamp caching is disabled (timeout is zero)")]
    TimestampsDisabled,

    #[error("No time stamp record is locked for this session")]
    NotLocked,

    // Security errors
    #[error(transparent)]
    Directory(#[from] DirError),

    #[error("Unable to switch to time stamp owner uid {uid}: {source}")]
    PrivilegeSwitch {
        uid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to restore privileges after time stamp file access: {source}")]
    PrivilegeRestore {
        #[source]
        source: std::io::Error,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // Record store errors
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unable to read the clock: {0}")]
    Clock(#[source] std::io::Error),

    // Identity errors
    #[error("Invalid user name for time stamp file: {0:?}")]
    InvalidUserName(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Unknown uid: {0}")]
    UnknownUid(u32),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl StampError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Security invariant violations that must abort the whole privileged
    /// operation instead of falling back to a password prompt
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Directory(e) => e.is_fatal(),
            Self::PrivilegeRestore { .. } => true,
            _ => false,
        }
    }

    /// Conditions a caller may treat as a cache miss
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TimestampsDisabled | Self::NotLocked => true,
            Self::Directory(e) => e.is_missing(),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Directory(e) if e.is_fatal() => {
                Some("Fix the ownership and mode of the time stamp directory (chown root, chmod 700)")
            }
            Self::PermissionDenied(_) => Some("Run this command as root"),
            Self::Lock(LockError::WouldBlock) => {
                Some("Another process holds this time stamp record; retry without --no-wait")
            }
            Self::TimestampsDisabled => Some("Set timestamp.timeout_minutes to a non-zero value"),
            _ => None,
        }
    }
}
