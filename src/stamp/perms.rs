//! Run file operations as the time stamp owner
//!
//! When the configured owner is not root and the process runs with an
//! effective uid of 0, time stamp files are opened with the owner's
//! effective ids so they end up owned by it.

use crate::error::{StampError, StampResult};
use crate::stamp::secure_dir::Owner;
use nix::unistd::{getegid, geteuid, setegid, seteuid, Gid, Uid};
use std::io;
use tracing::debug;

struct SavedIds {
    euid: Uid,
    egid: Gid,
}

fn switch_to(owner: Owner) -> StampResult<Option<SavedIds>> {
    let (euid, egid) = (geteuid(), getegid());
    if owner.uid == 0 || !euid.is_root() {
        return Ok(None);
    }

    debug!("switching effective ids to {}:{}", owner.uid, owner.gid);
    setegid(Gid::from_raw(owner.gid)).map_err(|e| StampError::PrivilegeSwitch {
        uid: owner.uid,
        source: e.into(),
    })?;
    if let Err(e) = seteuid(Uid::from_raw(owner.uid)) {
        // Still root here, so the group can always be put back.
        if let Err(back) = setegid(egid) {
            debug!("unable to restore egid {}: {}", egid, back);
        }
        return Err(StampError::PrivilegeSwitch {
            uid: owner.uid,
            source: e.into(),
        });
    }
    Ok(Some(SavedIds { euid, egid }))
}

fn restore(saved: SavedIds) -> StampResult<()> {
    seteuid(saved.euid).map_err(|e| StampError::PrivilegeRestore { source: e.into() })?;
    setegid(saved.egid).map_err(|e| StampError::PrivilegeRestore { source: e.into() })?;
    Ok(())
}

/// Run `op` with the owner's effective ids.
///
/// The outer result carries privilege failures, which are fatal; the inner
/// result is whatever `op` returned. If privileges cannot be restored the
/// value produced by `op` (an open file, say) is dropped.
pub fn as_stamp_owner<T>(
    owner: Owner,
    op: impl FnOnce() -> io::Result<T>,
) -> StampResult<io::Result<T>> {
    let saved = switch_to(owner)?;
    let result = op();
    if let Some(saved) = saved {
        restore(saved)?;
    }
    Ok(result)
}
