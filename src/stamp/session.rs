//! Per-invocation time stamp session
//!
//! A session owns the descriptor of one user's time stamp file and walks
//! through `open -> lock -> status/update -> close`. Locking takes the leader
//! lock just long enough to find or append the scope's record, then holds the
//! record's own lock until the session is closed.

use crate::error::{StampError, StampResult};
use crate::stamp::clock::{Clock, SystemClock};
use crate::stamp::kernel::KernelTicket;
use crate::stamp::key::{KeyBuilder, ScopeMode};
use crate::stamp::lock::{lock_region, LockMode, RegionGuard};
use crate::stamp::perms::as_stamp_owner;
use crate::stamp::procinfo::OsFacts;
use crate::stamp::record::Record;
use crate::stamp::secure_dir::{check_dir, ensure_secure_dir, Owner};
use crate::stamp::store::{RecordStore, SLOT_LEN};
use crate::stamp::stamp_path;
use crate::stamp::validate::{
    RecordSlot, StatusCheck, StatusReason, Timeout, TimestampStatus, Validator,
};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Mode of time stamp files
pub const FILE_MODE: u32 = 0o600;

/// Resolved time stamp settings
#[derive(Debug, Clone, PartialEq)]
pub struct StampSettings {
    pub dir: PathBuf,
    pub owner: Owner,
    pub timeout: Timeout,
    pub scope: ScopeMode,
    pub lecture_dir: PathBuf,
}

/// Process-level collaborators of a session
#[derive(Clone)]
pub struct SessionEnv {
    pub clock: Arc<dyn Clock>,
    pub facts: OsFacts,
    pub kernel: Option<Arc<dyn KernelTicket>>,
}

impl SessionEnv {
    /// Host clocks and facts read from the running process
    pub fn system() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            facts: OsFacts::current(),
            kernel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    LeaderLocked,
    RecordLocated,
    RecordLocked,
}

pub struct CacheSession {
    settings: StampSettings,
    env: SessionEnv,
    path: PathBuf,
    file: File,
    session_id: i32,
    state: SessionState,
    slot: Option<RecordSlot>,
    key: Option<Record>,
}

impl CacheSession {
    /// Open `user`'s time stamp file with the host environment
    pub fn open(settings: &StampSettings, user: &str, session_id: i32) -> StampResult<Self> {
        Self::open_with(settings, user, session_id, SessionEnv::system())
    }

    /// Open `user`'s time stamp file, creating the directory and file as
    /// needed. A file last modified before the system booted is removed and
    /// recreated.
    pub fn open_with(
        settings: &StampSettings,
        user: &str,
        session_id: i32,
        env: SessionEnv,
    ) -> StampResult<Self> {
        if settings.timeout == Timeout::Disabled {
            return Err(StampError::TimestampsDisabled);
        }
        let path = stamp_path(&settings.dir, user)?;
        ensure_secure_dir(&settings.dir, settings.owner, true)?;

        let mut first_try = true;
        let file = loop {
            let file = open_stamp_file(&path, settings.owner, true)?;

            if first_try && predates_boot(&file, env.clock.as_ref()) {
                info!("removing time stamp file that predates boot time: {}", path.display());
                drop(file);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(StampError::io(format!("unable to remove {}", path.display()), e))
                    }
                }
                first_try = false;
                continue;
            }
            break file;
        };

        debug!("opened time stamp file {}", path.display());
        Ok(Self {
            settings: settings.clone(),
            env,
            path,
            file,
            session_id,
            state: SessionState::Opened,
            slot: None,
            key: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the record checked and updated by this session
    pub fn record_offset(&self) -> Option<u64> {
        self.slot.map(|s| s.offset)
    }

    /// Locate or create the scope record for `auth_uid` and lock it,
    /// waiting for other processes in the same scope
    pub fn lock(&mut self, auth_uid: u32) -> StampResult<()> {
        self.lock_with(auth_uid, LockMode::Wait)
    }

    pub fn lock_with(&mut self, auth_uid: u32, mode: LockMode) -> StampResult<()> {
        let store = RecordStore::new(&self.file, &self.path);
        let scope = self.settings.scope;
        let builder = KeyBuilder::new(&self.env.facts).with_session_id(self.session_id);

        let leader = RegionGuard::acquire(&self.file, 0, SLOT_LEN, mode)?;
        self.state = SessionState::LeaderLocked;

        let start = store.ensure_leader()?;
        debug!(
            "searching for {} time stamp record",
            if scope == ScopeMode::ParentProcess { "ppid" } else { "tty" }
        );
        let lock_key = builder.build_nonglobal(Some(auth_uid), scope);
        let (lock_offset, _) = store.find_or_append(start, &lock_key)?;
        debug!("lock record position is {}", lock_offset);

        let (key, slot) = if scope == ScopeMode::Global {
            // The global record is shared by every session of the user, so it
            // is only ever locked around a single read or write.
            let key = builder.build(Some(auth_uid), ScopeMode::Global);
            let (offset, _) = store.find_or_append(0, &key)?;
            debug!("global record position is {}", offset);
            (
                key,
                RecordSlot {
                    offset,
                    locked: false,
                },
            )
        } else {
            (
                lock_key,
                RecordSlot {
                    offset: lock_offset,
                    locked: true,
                },
            )
        };
        self.state = SessionState::RecordLocated;
        drop(leader);

        // Nothing is recorded until the lock is held, so a failed or
        // interrupted wait leaves the session unable to update.
        if let Err(e) = lock_region(&self.file, lock_offset, SLOT_LEN, mode) {
            self.state = SessionState::Opened;
            return Err(e.into());
        }
        self.key = Some(key);
        self.slot = Some(slot);
        self.state = SessionState::RecordLocked;
        Ok(())
    }

    fn validator(&self) -> Validator<'_> {
        let validator = Validator::new(self.settings.timeout, self.env.clock.as_ref());
        match (&self.env.kernel, self.settings.scope) {
            (Some(kernel), ScopeMode::Kernel) => validator.with_kernel(kernel.as_ref()),
            _ => validator,
        }
    }

    /// Classify this session's record.
    ///
    /// Before `lock` the record is looked up without creating it; a scope
    /// with no record yet is `Missing`.
    pub fn status(&self) -> StatusCheck {
        let store = RecordStore::new(&self.file, &self.path);
        let slot = match self.slot {
            Some(slot) => Some(slot),
            None => match self.lookup(&store) {
                Ok(Some(slot)) => Some(slot),
                Ok(None) => {
                    debug!("no time stamp record for this scope");
                    return StatusCheck::new(TimestampStatus::Missing, StatusReason::NoRecord);
                }
                Err(e) => {
                    debug!("time stamp lookup failed: {}", e);
                    return StatusCheck::from_error(&e);
                }
            },
        };
        self.validator().check(&store, slot, self.session_id)
    }

    /// Same as [`status`](Self::status)
    pub fn check(&self) -> StatusCheck {
        self.status()
    }

    /// Find the record this session would use, without appending
    fn lookup(&self, store: &RecordStore<'_>) -> StampResult<Option<RecordSlot>> {
        let uid = self.current_auth_uid();
        let builder = KeyBuilder::new(&self.env.facts).with_session_id(self.session_id);
        let _leader = RegionGuard::acquire(&self.file, 0, SLOT_LEN, LockMode::Wait)?;

        let key = if self.settings.scope == ScopeMode::Global {
            builder.build(uid, ScopeMode::Global)
        } else {
            builder.build_nonglobal(uid, self.settings.scope)
        };
        let found = store.find(SLOT_LEN, &key)?;
        Ok(found.map(|(offset, _)| RecordSlot {
            offset,
            locked: false,
        }))
    }

    fn current_auth_uid(&self) -> Option<u32> {
        self.key.map(|k| k.auth_uid)
    }

    /// Record a successful authentication
    pub fn update(&mut self) -> StampResult<Record> {
        let (Some(slot), Some(key)) = (self.slot, self.key) else {
            return Err(StampError::NotLocked);
        };
        let store = RecordStore::new(&self.file, &self.path);
        let written = self.validator().update(&store, slot, &key)?;
        self.key = Some(written);
        Ok(written)
    }

    /// Release the record lock and the descriptor
    pub fn close(self) {
        debug!("closing time stamp file {}", self.path.display());
        drop(self.file);
    }
}

/// Invalidate `user`'s time stamps without a session.
///
/// With `unlink` the whole file is deleted. Otherwise every record matching
/// the configured scope is disabled while the leader lock is held. A missing
/// directory, file or record is not an error.
pub fn remove(
    settings: &StampSettings,
    user: &str,
    env: &SessionEnv,
    unlink: bool,
) -> StampResult<()> {
    if settings.scope == ScopeMode::Kernel {
        if let Some(kernel) = &env.kernel {
            match kernel.clear() {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("kernel ticket unsupported, using file"),
                Err(e) => debug!("unable to clear kernel ticket: {}", e),
            }
        }
    }

    let path = stamp_path(&settings.dir, user)?;
    match check_dir(&settings.dir, settings.owner.uid) {
        Ok(()) => {}
        Err(e) if e.is_missing() => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    if unlink {
        return match fs::remove_file(&path) {
            Ok(()) => {
                info!("removed time stamp file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StampError::io(format!("unable to remove {}", path.display()), e)),
        };
    }

    let file = match open_stamp_file(&path, settings.owner, false) {
        Ok(file) => file,
        Err(StampError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            return Ok(())
        }
        Err(e) => return Err(e),
    };
    let store = RecordStore::new(&file, &path);
    let _leader = RegionGuard::acquire(&file, 0, SLOT_LEN, LockMode::Wait)?;

    let key = KeyBuilder::new(&env.facts).build(None, settings.scope);
    let disabled = store.disable_matching(0, &key)?;
    debug!("disabled {} time stamp records in {}", disabled, path.display());
    Ok(())
}

/// Open a time stamp file as its owner
fn open_stamp_file(path: &Path, owner: Owner, create: bool) -> StampResult<File> {
    let opened = as_stamp_owner(owner, || {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .mode(FILE_MODE)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
    })?;
    opened.map_err(|e| StampError::io(format!("unable to open {}", path.display()), e))
}

/// Whether the file was last modified before the system booted. A boot time
/// in the future is ignored.
fn predates_boot(file: &File, clock: &dyn Clock) -> bool {
    let (Ok(now), Some(boot)) = (clock.realtime(), clock.boot_time()) else {
        return false;
    };
    if now < boot {
        debug!("ignoring boot time that is in the future");
        return false;
    }
    match file.metadata().and_then(|m| m.modified()) {
        Ok(mtime) => mtime < boot,
        Err(_) => false,
    }
}
