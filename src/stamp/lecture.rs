//! Per-user marker recording that the first-use notice was shown

use crate::error::{StampError, StampResult};
use crate::stamp::perms::as_stamp_owner;
use crate::stamp::secure_dir::{check_dir, ensure_secure_dir};
use crate::stamp::session::{StampSettings, FILE_MODE};
use crate::stamp::stamp_path;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use tracing::debug;

/// Whether `user` has already seen the notice.
///
/// An insecure or missing lecture directory counts as "not yet".
pub fn already_lectured(settings: &StampSettings, user: &str) -> bool {
    let Ok(path) = stamp_path(&settings.lecture_dir, user) else {
        return false;
    };
    if let Err(e) = check_dir(&settings.lecture_dir, settings.owner.uid) {
        debug!("lecture directory not usable: {}", e);
        return false;
    }
    path.exists()
}

/// Record that `user` has seen the notice
pub fn set_lectured(settings: &StampSettings, user: &str) -> StampResult<()> {
    let path = stamp_path(&settings.lecture_dir, user)?;
    ensure_secure_dir(&settings.lecture_dir, settings.owner, true)?;

    let created = as_stamp_owner(settings.owner, || {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(FILE_MODE)
            .open(&path)
    })?;
    match created {
        Ok(_) => {
            debug!("created lecture status file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(StampError::io(format!("unable to create {}", path.display()), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::key::ScopeMode;
    use crate::stamp::secure_dir::Owner;
    use crate::stamp::validate::Timeout;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(root: &TempDir) -> StampSettings {
        let owner = Owner {
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
        };
        StampSettings {
            dir: root.path().join("ts"),
            owner,
            timeout: Timeout::After(Duration::from_secs(300)),
            scope: ScopeMode::Terminal,
            lecture_dir: root.path().join("lectured"),
        }
    }

    #[test]
    fn mark_then_query() {
        let root = TempDir::new().unwrap();
        let settings = settings(&root);
        assert!(!already_lectured(&settings, "alice"));
        // Querying never creates the directory.
        assert!(!settings.lecture_dir.exists());

        set_lectured(&settings, "alice").unwrap();
        assert!(already_lectured(&settings, "alice"));
        assert!(!already_lectured(&settings, "bob"));

        // Marking twice is fine.
        set_lectured(&settings, "alice").unwrap();
    }

    #[test]
    fn insecure_directory_means_not_lectured() {
        let root = TempDir::new().unwrap();
        let settings = settings(&root);
        set_lectured(&settings, "alice").unwrap();

        fs::set_permissions(&settings.lecture_dir, fs::Permissions::from_mode(0o777)).unwrap();
        assert!(!already_lectured(&settings, "alice"));
        assert!(set_lectured(&settings, "alice").unwrap_err().is_fatal());
    }
}
