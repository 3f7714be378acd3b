//! Clock sources for time stamp records
//!
//! Records store a monotonic time (one that does not jump when the wall
//! clock is changed). Boot time and real time are only used to purge files
//! left over from a previous boot.

use nix::time::{clock_gettime, ClockId};
use std::fmt;
use std::io;
use std::time::{Duration, SystemTime};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Seconds and nanoseconds, as stored on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

    /// Create a timespec, carrying whole seconds out of `nsec`
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self {
            sec: sec.saturating_add(nsec.div_euclid(NANOS_PER_SEC)),
            nsec: nsec.rem_euclid(NANOS_PER_SEC),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    /// Total nanoseconds; tolerates unnormalized values read from disk
    pub fn as_nanos(&self) -> i128 {
        i128::from(self.sec) * i128::from(NANOS_PER_SEC) + i128::from(self.nsec)
    }

    /// Signed nanoseconds elapsed from `earlier` to `self`
    pub fn nanos_since(&self, earlier: Timespec) -> i128 {
        self.as_nanos() - earlier.as_nanos()
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Time sources consulted by the validator and by `open`
pub trait Clock {
    /// Current value of the clock stored in records
    fn monotonic(&self) -> io::Result<Timespec>;

    /// Whether `monotonic` can never run backwards.
    ///
    /// When false the validator falls back to a coarse heuristic for
    /// detecting records stamped in the future.
    fn is_monotonic(&self) -> bool {
        true
    }

    fn realtime(&self) -> io::Result<SystemTime> {
        Ok(SystemTime::now())
    }

    /// When the system booted, if it can be determined
    fn boot_time(&self) -> Option<SystemTime>;
}

/// The host's clocks
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

// CLOCK_BOOTTIME keeps counting while suspended, so a laptop lid close does
// not extend the validity window.
#[cfg(any(target_os = "linux", target_os = "android"))]
const STAMP_CLOCK: ClockId = ClockId::CLOCK_BOOTTIME;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const STAMP_CLOCK: ClockId = ClockId::CLOCK_MONOTONIC;

impl Clock for SystemClock {
    fn monotonic(&self) -> io::Result<Timespec> {
        let ts = clock_gettime(STAMP_CLOCK)?;
        Ok(Timespec::new(i64::from(ts.tv_sec()), i64::from(ts.tv_nsec())))
    }

    fn boot_time(&self) -> Option<SystemTime> {
        system_boot_time()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn system_boot_time() -> Option<SystemTime> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let secs = parse_btime(&stat)?;
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn system_boot_time() -> Option<SystemTime> {
    let mut mib = [libc::CTL_KERN, libc::KERN_BOOTTIME];
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let mut len = std::mem::size_of::<libc::timeval>();
    // SAFETY: mib, tv and len are valid for the duration of the call and
    // len holds the size of the output buffer.
    let rc = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            2,
            (&mut tv as *mut libc::timeval).cast(),
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc != 0 || tv.tv_sec <= 0 {
        return None;
    }
    let secs = u64::try_from(tv.tv_sec).ok()?;
    let micros = u64::try_from(tv.tv_usec).unwrap_or(0);
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(micros))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
)))]
fn system_boot_time() -> Option<SystemTime> {
    None
}

/// Extract the `btime` line from the contents of `/proc/stat`
#[cfg_attr(
    not(any(target_os = "linux", target_os = "android")),
    allow(dead_code)
)]
fn parse_btime(stat: &str) -> Option<u64> {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|rest| rest.trim().parse().ok())
}
