//! Time stamp directory verification and creation
//!
//! A directory is trusted only if it is owned by the configured time stamp
//! owner and nobody else can write to it. Missing directories may be
//! created, together with any missing parents.

use nix::sys::stat::{umask, Mode};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Mode of the time stamp directory itself
pub const DIR_MODE: u32 = 0o700;

/// Mode of parent directories created on the way
pub const PARENT_MODE: u32 = 0o711;

const GROUP_OR_OTHER_WRITE: u32 = 0o022;

/// Identity that owns time stamp directories and files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Successful outcome of [`ensure_secure_dir`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirCheck {
    Secure,
    Created,
}

/// Directory security failures
#[derive(Debug, Error)]
pub enum DirError {
    #[error("{path} does not exist")]
    Missing { path: PathBuf },

    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("{path} is owned by uid {uid}, should be {expected}")]
    WrongOwner {
        path: PathBuf,
        uid: u32,
        expected: u32,
    },

    #[error("{path} is group or world writable (mode {mode:o})")]
    Writable { path: PathBuf, mode: u32 },

    #[error("unable to mkdir {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DirError {
    /// Ownership and permission problems cannot be fixed by retrying
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WrongOwner { .. } | Self::Writable { .. })
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}

/// Verify that `path` is a directory owned by `owner_uid` and not writable by
/// group or other
pub fn check_dir(path: &Path, owner_uid: u32) -> Result<(), DirError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DirError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(DirError::Stat {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if !meta.is_dir() {
        return Err(DirError::NotADirectory {
            path: path.to_path_buf(),
        });
    }
    if meta.uid() != owner_uid {
        return Err(DirError::WrongOwner {
            path: path.to_path_buf(),
            uid: meta.uid(),
            expected: owner_uid,
        });
    }
    let mode = meta.mode() & 0o7777;
    if mode & GROUP_OR_OTHER_WRITE != 0 {
        return Err(DirError::Writable {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

/// Check `path`, creating it (and missing parents) when `create` is set
pub fn ensure_secure_dir(path: &Path, owner: Owner, create: bool) -> Result<DirCheck, DirError> {
    debug!("checking {}", path.display());
    match check_dir(path, owner.uid) {
        Ok(()) => Ok(DirCheck::Secure),
        Err(DirError::Missing { .. }) if create => {
            make_dirs(path, owner)?;
            Ok(DirCheck::Created)
        }
        Err(e) => Err(e),
    }
}

/// Restores the previous umask when dropped
struct UmaskGuard {
    saved: Mode,
}

impl UmaskGuard {
    fn set(mask: Mode) -> Self {
        Self {
            saved: umask(mask),
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.saved);
    }
}

fn make_dirs(path: &Path, owner: Owner) -> Result<(), DirError> {
    // The umask must not strip bits from the modes we ask for.
    let _umask = UmaskGuard::set(Mode::from_bits_truncate(
        (0o777 & !(DIR_MODE | PARENT_MODE)) as libc::mode_t,
    ));

    let missing_parents: Vec<&Path> = path
        .ancestors()
        .skip(1)
        .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
        .collect();

    for parent in missing_parents.into_iter().rev() {
        debug!("mkdir {}, mode {:o}", parent.display(), PARENT_MODE);
        create_one(parent, PARENT_MODE, owner)?;
    }

    debug!(
        "mkdir {}, mode {:o}, uid {}, gid {}",
        path.display(),
        DIR_MODE,
        owner.uid,
        owner.gid
    );
    create_one(path, DIR_MODE, owner)
}

fn create_one(path: &Path, mode: u32, owner: Owner) -> Result<(), DirError> {
    match DirBuilder::new().mode(mode).create(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(source) => {
            return Err(DirError::Create {
                path: path.to_path_buf(),
                source,
            })
        }
    }
    if let Err(e) = std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid)) {
        debug!(
            "unable to chown {}:{} {}: {}",
            owner.uid,
            owner.gid,
            path.display(),
            e
        );
    }
    Ok(())
}
