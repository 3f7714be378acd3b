//! Credential time stamp cache
//!
//! One file per user under a root-owned directory records when the user
//! last authenticated, per terminal, per parent process or globally. Many
//! processes may race on the same file; structural changes are serialized
//! with a leader lock on the first record and each scope's record has its
//! own lock.

pub mod clock;
pub mod kernel;
pub mod key;
pub mod lecture;
pub mod lock;
pub mod perms;
pub mod procinfo;
pub mod record;
pub mod secure_dir;
pub mod session;
pub mod store;
pub mod validate;

pub use clock::{Clock, SystemClock, Timespec};
pub use kernel::{KernelTicket, KernelVerdict};
pub use key::{KeyBuilder, ScopeMode};
pub use lecture::{already_lectured, set_lectured};
pub use lock::{LockError, LockMode};
pub use procinfo::OsFacts;
pub use record::{Record, RecordFlags, RecordKind, RECORD_SIZE};
pub use secure_dir::{DirError, Owner};
pub use session::{remove, CacheSession, SessionEnv, SessionState, StampSettings};
pub use store::{RecordStore, StoreError};
pub use validate::{StatusCheck, StatusReason, Timeout, TimestampStatus, Validator};

use crate::error::{StampError, StampResult};
use std::path::{Path, PathBuf};

/// Path of `user`'s file under `dir`.
///
/// The name becomes a single path component, so separators and dot entries
/// are rejected.
pub fn stamp_path(dir: &Path, user: &str) -> StampResult<PathBuf> {
    if user.is_empty() || user == "." || user == ".." || user.contains('/') || user.contains('\0') {
        return Err(StampError::InvalidUserName(user.to_string()));
    }
    Ok(dir.join(user))
}
