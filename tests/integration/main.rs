//! Integration tests for credstamp

/// Shared fixtures: a temporary cache owned by the current user and a
/// controllable clock
mod fixture {
    use credstamp::stamp::{
        Clock, OsFacts, Owner, ScopeMode, SessionEnv, StampSettings, Timeout, Timespec,
    };
    use credstamp::stamp::procinfo::{ParentFacts, TerminalFacts};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, getegid, geteuid, ForkResult, Pid};
    use std::cell::Cell;
    use std::io;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    pub struct TestClock {
        pub now: Cell<i64>,
        pub boot: Cell<Option<SystemTime>>,
    }

    impl TestClock {
        pub fn at(sec: i64) -> Arc<Self> {
            Arc::new(Self {
                now: Cell::new(sec),
                boot: Cell::new(None),
            })
        }
    }

    impl Clock for TestClock {
        fn monotonic(&self) -> io::Result<Timespec> {
            Ok(Timespec::new(self.now.get(), 0))
        }

        fn boot_time(&self) -> Option<SystemTime> {
            self.boot.get()
        }
    }

    pub fn owner() -> Owner {
        Owner {
            uid: geteuid().as_raw(),
            gid: getegid().as_raw(),
        }
    }

    pub fn settings(root: &TempDir, scope: ScopeMode) -> StampSettings {
        StampSettings {
            dir: root.path().join("ts"),
            owner: owner(),
            timeout: Timeout::After(Duration::from_secs(300)),
            scope,
            lecture_dir: root.path().join("lectured"),
        }
    }

    pub fn facts(device: Option<u64>) -> OsFacts {
        OsFacts {
            session_id: 4000,
            terminal: device.map(|device| TerminalFacts {
                device,
                leader_start: Timespec::new(70, 0),
            }),
            parent: ParentFacts {
                pid: 4001,
                start_time: Timespec::new(71, 0),
            },
        }
    }

    pub fn env(clock: &Arc<TestClock>, device: Option<u64>) -> SessionEnv {
        SessionEnv {
            clock: clock.clone(),
            facts: facts(device),
            kernel: None,
        }
    }

    /// Fork a child running `f`; the child exits 0 when `f` returns true
    pub fn spawn_child(f: impl FnOnce() -> bool) -> Pid {
        // SAFETY: the child runs `f` and leaves through _exit without
        // unwinding into the test harness.
        match unsafe { fork() }.expect("fork failed") {
            ForkResult::Child => {
                let ok = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or(false);
                unsafe { libc::_exit(if ok { 0 } else { 1 }) }
            }
            ForkResult::Parent { child } => child,
        }
    }

    /// Run `f` in a forked child and report whether it returned true
    pub fn in_child(f: impl FnOnce() -> bool) -> bool {
        wait_ok(spawn_child(f))
    }

    pub fn wait_ok(pid: Pid) -> bool {
        matches!(waitpid(pid, None), Ok(WaitStatus::Exited(_, 0)))
    }
}

mod scenario_tests {
    use super::fixture::{self, TestClock};
    use credstamp::stamp::{
        remove, CacheSession, LockError, LockMode, RecordStore, ScopeMode, StatusReason,
        TimestampStatus, RECORD_SIZE,
    };
    use credstamp::StampError;
    use serial_test::serial;
    use std::fs::{self, File};
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant, SystemTime};
    use tempfile::TempDir;

    const TTY: Option<u64> = Some(0x8805);
    const SLOT: u64 = RECORD_SIZE as u64;

    #[test]
    #[serial]
    fn new_user_gets_dir_file_and_old_record() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);

        let mut session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        let dir_mode = fs::metadata(&settings.dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);

        session.lock(1000).unwrap();
        assert_eq!(session.status().status, TimestampStatus::Old);

        let path = settings.dir.join("alice");
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * SLOT);
        let file = File::open(&path).unwrap();
        let store = RecordStore::new(&file, &path);
        assert!(store.read_at(0).unwrap().kind == credstamp::stamp::RecordKind::LeaderLock);
        assert!(matches!(
            store.read_at(SLOT).unwrap().kind,
            credstamp::stamp::RecordKind::Terminal { device: 0x8805, .. }
        ));
    }

    #[test]
    #[serial]
    fn update_makes_status_current() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);

        let mut session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        session.lock(1000).unwrap();
        session.update().unwrap();
        assert_eq!(session.status().status, TimestampStatus::Current);
    }

    #[test]
    #[serial]
    fn aged_stamp_is_old() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);

        let mut session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        session.lock(1000).unwrap();
        session.update().unwrap();

        clock.now.set(1299);
        assert!(session.status().is_current());
        clock.now.set(1301);
        let check = session.status();
        assert_eq!(check.status, TimestampStatus::Old);
        assert_eq!(check.reason, StatusReason::Expired);
    }

    #[test]
    #[serial]
    fn future_stamp_is_disabled_on_disk() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000 + 3600);

        let mut session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        session.lock(1000).unwrap();
        session.update().unwrap();
        let offset = session.record_offset().unwrap();

        clock.now.set(1000);
        let check = session.status();
        assert_eq!(check.status, TimestampStatus::Old);
        assert_eq!(check.reason, StatusReason::FromFuture);

        let path = settings.dir.join("alice");
        let file = File::open(&path).unwrap();
        assert!(RecordStore::new(&file, &path).read_at(offset).unwrap().is_disabled());

        // Even once the clock catches up the record stays unusable.
        clock.now.set(1000 + 3600);
        assert_eq!(session.status().reason, StatusReason::Disabled);
    }

    #[test]
    #[serial]
    fn selective_remove_then_status_is_old() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);
        let env = fixture::env(&clock, TTY);

        let mut session = CacheSession::open_with(&settings, "alice", 4000, env.clone()).unwrap();
        session.lock(1000).unwrap();
        session.update().unwrap();
        session.close();

        remove(&settings, "alice", &env, false).unwrap();

        let mut session = CacheSession::open_with(&settings, "alice", 4000, env).unwrap();
        session.lock(1000).unwrap();
        let check = session.status();
        assert_eq!(check.status, TimestampStatus::Old);
        assert_eq!(check.reason, StatusReason::Disabled);
    }

    #[test]
    #[serial]
    fn full_remove_then_status_is_missing() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);
        let env = fixture::env(&clock, TTY);

        let mut session = CacheSession::open_with(&settings, "alice", 4000, env.clone()).unwrap();
        session.lock(1000).unwrap();
        session.update().unwrap();
        session.close();

        remove(&settings, "alice", &env, true).unwrap();
        let session = CacheSession::open_with(&settings, "alice", 4000, env).unwrap();
        assert_eq!(session.status().status, TimestampStatus::Missing);
    }

    #[test]
    #[serial]
    fn file_from_previous_boot_is_purged() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);

        let mut session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        session.lock(1000).unwrap();
        session.update().unwrap();
        session.close();

        std::thread::sleep(Duration::from_millis(50));
        clock.boot.set(Some(SystemTime::now()));

        let session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        assert_eq!(fs::metadata(session.path()).unwrap().len(), 0);
        assert_eq!(session.status().status, TimestampStatus::Missing);
    }

    #[test]
    #[serial]
    fn boot_time_in_future_is_ignored() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);

        let mut session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        session.lock(1000).unwrap();
        session.update().unwrap();
        session.close();

        clock
            .boot
            .set(Some(SystemTime::now() + Duration::from_secs(3600)));
        let mut session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        session.lock(1000).unwrap();
        assert!(session.status().is_current());
    }

    #[test]
    #[serial]
    fn writable_directory_is_fatal() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);
        fs::create_dir(&settings.dir).unwrap();
        fs::set_permissions(&settings.dir, fs::Permissions::from_mode(0o777)).unwrap();

        let err = CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY))
            .err()
            .unwrap();
        assert!(err.is_fatal());
        assert!(matches!(err, StampError::Directory(_)));
    }

    #[test]
    #[serial]
    fn same_scope_excludes_other_process() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);

        let mut session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        session.lock(1000).unwrap();

        let blocked = fixture::in_child(|| {
            let clock = TestClock::at(1000);
            let mut other =
                CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY))
                    .unwrap();
            matches!(
                other.lock_with(1000, LockMode::Try),
                Err(StampError::Lock(LockError::WouldBlock))
            )
        });
        assert!(blocked, "second process locked a held scope");

        // A different terminal is a different scope.
        let other_scope = fixture::in_child(|| {
            let clock = TestClock::at(1000);
            let mut other = CacheSession::open_with(
                &settings,
                "alice",
                4000,
                fixture::env(&clock, Some(0x8806)),
            )
            .unwrap();
            other.lock_with(1000, LockMode::Try).is_ok()
        });
        assert!(other_scope, "different scopes must not contend");

        session.close();
        let free = fixture::in_child(|| {
            let clock = TestClock::at(1000);
            let mut other =
                CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY))
                    .unwrap();
            other.lock_with(1000, LockMode::Try).is_ok()
        });
        assert!(free, "scope still locked after close");
    }

    #[test]
    #[serial]
    fn second_locker_waits_for_close() {
        let root = TempDir::new().unwrap();
        let settings = fixture::settings(&root, ScopeMode::Terminal);
        let clock = TestClock::at(1000);

        let mut session =
            CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY)).unwrap();
        session.lock(1000).unwrap();

        let pid = fixture::spawn_child(|| {
            let clock = TestClock::at(1000);
            let started = Instant::now();
            let ok = CacheSession::open_with(&settings, "alice", 4000, fixture::env(&clock, TTY))
                .and_then(|mut other| other.lock(1000))
                .is_ok();
            ok && started.elapsed() >= Duration::from_millis(200)
        });

        std::thread::sleep(Duration::from_millis(400));
        session.close();
        assert!(fixture::wait_ok(pid), "child did not wait for the lock");
    }
}

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use serial_test::serial;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn credstamp() -> Command {
        cargo_bin_cmd!("credstamp")
    }

    fn current_user() -> String {
        let mut users = credstamp::users::PasswdCache::new();
        users.lookup_uid(nix::unistd::geteuid().as_raw()).unwrap().name
    }

    /// Write a config whose cache lives under `root` and is owned by the
    /// current user
    fn write_config(root: &Path) -> PathBuf {
        let path = root.join("config.toml");
        let config = format!(
            r#"
[general]
audit_log = true
audit_log_path = "{root}/audit.log"

[timestamp]
dir = "{root}/ts"
owner = "{owner}"
timeout_minutes = 5
scope = "tty"

[lecture]
dir = "{root}/lectured"
"#,
            root = root.display(),
            owner = current_user()
        );
        std::fs::write(&path, config).unwrap();
        path
    }

    #[test]
    fn help_displays() {
        credstamp()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("credential time stamp cache"));
    }

    #[test]
    fn version_displays() {
        credstamp()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("credstamp"));
    }

    #[test]
    fn config_path_honours_flag() {
        let root = TempDir::new().unwrap();
        let config = write_config(root.path());
        credstamp()
            .args(["config", "path"])
            .arg("--config")
            .arg(&config)
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let root = TempDir::new().unwrap();
        let config = write_config(root.path());
        credstamp()
            .env("CREDSTAMP_CONFIG", &config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[timestamp]"));
    }

    #[test]
    fn invalid_config_fails() {
        let root = TempDir::new().unwrap();
        let config = root.path().join("config.toml");
        std::fs::write(&config, "[timestamp]\nscope = \"sometimes\"\n").unwrap();
        credstamp()
            .arg("--config")
            .arg(&config)
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn completions_bash() {
        credstamp()
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("credstamp"));
    }

    #[test]
    #[serial]
    fn refresh_status_invalidate_cycle() {
        let root = TempDir::new().unwrap();
        let config = write_config(root.path());

        credstamp()
            .arg("-c")
            .arg(&config)
            .arg("status")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("old"));

        credstamp()
            .arg("-c")
            .arg(&config)
            .arg("refresh")
            .assert()
            .success()
            .stdout(predicate::str::contains("Time stamp refreshed"));

        credstamp()
            .arg("-c")
            .arg(&config)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("current"));

        credstamp()
            .arg("-c")
            .arg(&config)
            .arg("invalidate")
            .assert()
            .success();

        credstamp()
            .arg("-c")
            .arg(&config)
            .args(["status", "--format", "json"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("\"status\": \"old\""));

        let audit = std::fs::read_to_string(root.path().join("audit.log")).unwrap();
        assert!(audit.contains("timestamp.refreshed"));
        assert!(audit.contains("timestamp.invalidated"));
    }

    #[test]
    #[serial]
    fn reset_removes_file() {
        let root = TempDir::new().unwrap();
        let config = write_config(root.path());

        credstamp()
            .arg("-c")
            .arg(&config)
            .arg("refresh")
            .assert()
            .success();
        let file = root.path().join("ts").join(current_user());
        assert!(file.exists());

        credstamp()
            .arg("-c")
            .arg(&config)
            .arg("reset")
            .assert()
            .success();
        assert!(!file.exists());
    }

    #[test]
    fn lecture_mark_and_query() {
        let root = TempDir::new().unwrap();
        let config = write_config(root.path());

        credstamp()
            .arg("-c")
            .arg(&config)
            .arg("lecture")
            .assert()
            .success()
            .stdout(predicate::str::contains("not lectured"));

        credstamp()
            .arg("-c")
            .arg(&config)
            .args(["lecture", "--mark"])
            .assert()
            .success();

        credstamp()
            .arg("-c")
            .arg(&config)
            .arg("lecture")
            .assert()
            .success()
            .stdout(predicate::str::contains(": lectured"));
    }

    #[test]
    fn other_user_needs_root() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let root = TempDir::new().unwrap();
        let config = write_config(root.path());
        credstamp()
            .arg("-c")
            .arg(&config)
            .args(["invalidate", "--user", "root"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Permission denied"));
    }
}
