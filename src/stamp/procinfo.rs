//! Live process facts that scope a time stamp record
//!
//! On Linux everything comes from `/proc`. Other unix systems get the
//! terminal device from `ttyname` and a zero start time, which still scopes
//! records by pid and device but cannot detect pid reuse.

use crate::stamp::clock::Timespec;
use nix::unistd::{getppid, getsid};
use tracing::debug;

/// Controlling terminal of the calling process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalFacts {
    pub device: u64,
    pub leader_start: Timespec,
}

/// Immediate parent of the calling process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentFacts {
    pub pid: i32,
    pub start_time: Timespec,
}

/// Everything the key builder needs to know about the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsFacts {
    pub session_id: i32,
    pub terminal: Option<TerminalFacts>,
    pub parent: ParentFacts,
}

impl OsFacts {
    /// Gather facts about the current process
    pub fn current() -> Self {
        let session_id = match getsid(None) {
            Ok(sid) => sid.as_raw(),
            Err(e) => {
                debug!("getsid failed: {}", e);
                -1
            }
        };
        let ppid = getppid().as_raw();

        let parent = ParentFacts {
            pid: ppid,
            start_time: process_start_time(ppid).unwrap_or_default(),
        };

        let terminal = controlling_terminal().map(|device| TerminalFacts {
            device,
            leader_start: if session_id > 0 {
                process_start_time(session_id).unwrap_or_default()
            } else {
                Timespec::ZERO
            },
        });

        let facts = Self {
            session_id,
            terminal,
            parent,
        };
        debug!("collected process facts: {:?}", facts);
        facts
    }
}

/// Fields of `/proc/<pid>/stat` used here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    tty_nr: u64,
    start_ticks: u64,
}

/// Parse `/proc/<pid>/stat`. The command name is parenthesised and may
/// contain spaces, so fields are counted from the last `)`.
#[cfg_attr(
    not(any(target_os = "linux", target_os = "android")),
    allow(dead_code)
)]
fn parse_proc_stat(contents: &str) -> Option<ProcStat> {
    let rest = &contents[contents.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3); tty_nr is field 7, starttime field 22.
    let tty_nr = fields.get(4)?.parse::<i64>().ok()?;
    let start_ticks = fields.get(19)?.parse().ok()?;
    Some(ProcStat {
        tty_nr: u64::try_from(tty_nr).unwrap_or(0),
        start_ticks,
    })
}

#[cfg_attr(
    not(any(target_os = "linux", target_os = "android")),
    allow(dead_code)
)]
fn ticks_to_timespec(ticks: u64, hz: u64) -> Timespec {
    if hz == 0 {
        return Timespec::ZERO;
    }
    let sec = i64::try_from(ticks / hz).unwrap_or(i64::MAX);
    let nsec = i64::try_from((ticks % hz) * (1_000_000_000 / hz)).unwrap_or(0);
    Timespec::new(sec, nsec)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn read_proc_stat(pid: &str) -> Option<ProcStat> {
    let contents = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_proc_stat(&contents)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn process_start_time(pid: i32) -> Option<Timespec> {
    let stat = read_proc_stat(&pid.to_string())?;
    let hz = nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK).ok()??;
    Some(ticks_to_timespec(stat.start_ticks, u64::try_from(hz).ok()?))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn controlling_terminal() -> Option<u64> {
    let stat = read_proc_stat("self")?;
    (stat.tty_nr != 0).then_some(stat.tty_nr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn process_start_time(_pid: i32) -> Option<Timespec> {
    None
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn controlling_terminal() -> Option<u64> {
    use std::io;
    use std::os::fd::AsFd;
    use std::os::unix::fs::MetadataExt;

    let streams = [
        io::stdin().as_fd().try_clone_to_owned(),
        io::stdout().as_fd().try_clone_to_owned(),
        io::stderr().as_fd().try_clone_to_owned(),
    ];
    for fd in streams.into_iter().flatten() {
        let Ok(name) = nix::unistd::ttyname(&fd) else {
            continue;
        };
        if let Ok(meta) = std::fs::metadata(&name) {
            return Some(meta.rdev());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "4242 (my (odd) cmd) S 4241 4242 4242 34816 4242 4194560 \
        1500 0 0 0 3 1 0 0 20 0 1 0 987654 10000000 500 18446744073709551615";

    #[test]
    fn parses_fields_after_command_name() {
        let stat = parse_proc_stat(SAMPLE).unwrap();
        assert_eq!(stat.tty_nr, 34816);
        assert_eq!(stat.start_ticks, 987654);
    }

    #[test]
    fn rejects_short_stat() {
        assert!(parse_proc_stat("1 (init) S 0 1").is_none());
        assert!(parse_proc_stat("garbage").is_none());
    }

    #[test]
    fn ticks_convert_with_clock_rate() {
        assert_eq!(ticks_to_timespec(250, 100), Timespec::new(2, 500_000_000));
        assert_eq!(ticks_to_timespec(5, 0), Timespec::ZERO);
    }

    #[test]
    fn current_facts_report_a_parent() {
        let facts = OsFacts::current();
        assert!(facts.parent.pid > 0);
    }
}
