//! Classify a located time stamp record
//!
//! The checks run in a fixed order and the first one that decides the
//! outcome wins. Records found to be stamped in the future are disabled on
//! disk so they cannot be reused once the clock catches up.

use crate::error::{StampError, StampResult};
use crate::stamp::clock::Clock;
use crate::stamp::kernel::{KernelTicket, KernelVerdict};
use crate::stamp::lock::{LockMode, RegionGuard};
use crate::stamp::record::{Record, RecordFlags, RecordKind};
use crate::stamp::store::{RecordStore, Slot, StoreError, SLOT_LEN};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// How far behind the stored time the clock may be before the record is
/// treated as tampered with
pub const FUTURE_TOLERANCE: Duration = Duration::from_secs(1);

/// Outcome of a time stamp check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampStatus {
    /// Recent authentication, no need to prompt
    Current,
    /// Present but not usable
    Old,
    /// No record exists for this scope
    Missing,
    /// Could not be determined; callers must prompt
    Error,
    /// A security invariant was violated
    Fatal,
}

impl fmt::Display for TimestampStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Current => "current",
            Self::Old => "old",
            Self::Missing => "missing",
            Self::Error => "error",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Which check decided a [`TimestampStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusReason {
    CachingDisabled,
    NoRecord,
    Kernel,
    ReadFailed,
    Foreign,
    Disabled,
    SessionMismatch,
    NeverExpires,
    ClockUnavailable,
    FromFuture,
    TooFarAhead,
    Expired,
    Fresh,
    Failed,
}

impl StatusReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::CachingDisabled => "time stamps are disabled",
            Self::NoRecord => "no time stamp record",
            Self::Kernel => "decided by kernel ticket",
            Self::ReadFailed => "unable to read time stamp record",
            Self::Foreign => "record has a foreign version or size",
            Self::Disabled => "record was invalidated",
            Self::SessionMismatch => "record belongs to another session",
            Self::NeverExpires => "time stamps never expire",
            Self::ClockUnavailable => "unable to read the clock",
            Self::FromFuture => "ignoring time stamp from the future",
            Self::TooFarAhead => "time stamp too far in the future",
            Self::Expired => "time stamp expired",
            Self::Fresh => "authenticated recently",
            Self::Failed => "time stamp check failed",
        }
    }

    /// Reasons that disabled the record because its time cannot be trusted
    pub fn is_tamper(&self) -> bool {
        matches!(self, Self::FromFuture | Self::TooFarAhead)
    }
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCheck {
    pub status: TimestampStatus,
    pub reason: StatusReason,
}

impl StatusCheck {
    pub fn new(status: TimestampStatus, reason: StatusReason) -> Self {
        Self { status, reason }
    }

    /// Classify an error raised before the validator could run
    pub fn from_error(err: &StampError) -> Self {
        if err.is_fatal() {
            Self::new(TimestampStatus::Fatal, StatusReason::Failed)
        } else if matches!(err, StampError::TimestampsDisabled) {
            Self::new(TimestampStatus::Old, StatusReason::CachingDisabled)
        } else if err.is_recoverable() {
            Self::new(TimestampStatus::Missing, StatusReason::NoRecord)
        } else {
            Self::new(TimestampStatus::Error, StatusReason::Failed)
        }
    }

    pub fn is_current(&self) -> bool {
        self.status == TimestampStatus::Current
    }
}

/// Validity window of a successful authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never reuse an authentication
    Disabled,
    /// Valid until explicitly invalidated
    Never,
    After(Duration),
}

impl Timeout {
    /// Zero minutes disables caching, a negative value never expires
    pub fn from_minutes(minutes: f64) -> Self {
        if minutes.is_nan() || minutes == 0.0 {
            Self::Disabled
        } else if minutes < 0.0 {
            Self::Never
        } else {
            Duration::try_from_secs_f64(minutes * 60.0)
                .map(Self::After)
                .unwrap_or(Self::Never)
        }
    }

    pub fn window(&self) -> Option<Duration> {
        match self {
            Self::After(d) => Some(*d),
            _ => None,
        }
    }
}

/// Position of the record a session checks, and whether the session holds
/// its lock for the whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSlot {
    pub offset: u64,
    pub locked: bool,
}

pub struct Validator<'a> {
    timeout: Timeout,
    clock: &'a dyn Clock,
    kernel: Option<&'a dyn KernelTicket>,
}

impl<'a> Validator<'a> {
    pub fn new(timeout: Timeout, clock: &'a dyn Clock) -> Self {
        Self {
            timeout,
            clock,
            kernel: None,
        }
    }

    pub fn with_kernel(mut self, kernel: &'a dyn KernelTicket) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Classify the record at `slot` for a caller in `session_id`
    pub fn check(
        &self,
        store: &RecordStore<'_>,
        slot: Option<RecordSlot>,
        session_id: i32,
    ) -> StatusCheck {
        use StatusReason as R;
        use TimestampStatus as S;

        let window = match self.timeout {
            Timeout::Disabled => {
                debug!("time stamps disabled");
                return StatusCheck::new(S::Old, R::CachingDisabled);
            }
            Timeout::Never => None,
            Timeout::After(d) => Some(d),
        };
        let Some(slot) = slot else {
            debug!("no time stamp record position");
            return StatusCheck::new(S::Old, R::NoRecord);
        };

        if let Some(kernel) = self.kernel {
            match kernel.check() {
                KernelVerdict::Current => return StatusCheck::new(S::Current, R::Kernel),
                KernelVerdict::Old => return StatusCheck::new(S::Old, R::Kernel),
                KernelVerdict::Unsupported => debug!("kernel ticket unsupported, using file"),
            }
        }

        // The guard covers both the read and any tamper write-back.
        let _guard = if slot.locked {
            None
        } else {
            match RegionGuard::acquire(store.file(), slot.offset, SLOT_LEN, LockMode::Wait) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!("unable to lock time stamp record: {}", e);
                    return StatusCheck::new(S::Error, R::ReadFailed);
                }
            }
        };

        let mut record = match store.read_at(slot.offset) {
            Ok(record) => record,
            Err(StoreError::Corrupt { offset, source, .. }) => {
                debug!("invalid time stamp file @ {}: {}", offset, source);
                return StatusCheck::new(S::Old, R::Foreign);
            }
            Err(e) => {
                debug!("unable to read time stamp record: {}", e);
                return StatusCheck::new(S::Error, R::ReadFailed);
            }
        };

        if !record.is_current_format() {
            debug!("invalid time stamp file @ {}", slot.offset);
            return StatusCheck::new(S::Old, R::Foreign);
        }
        if record.is_disabled() {
            debug!("time stamp record disabled");
            return StatusCheck::new(S::Old, R::Disabled);
        }
        if record.kind != RecordKind::Global && record.session_id != session_id {
            debug!("time stamp record sid mismatch");
            return StatusCheck::new(S::Old, R::SessionMismatch);
        }
        let Some(window) = window else {
            debug!("time stamp record does not expire");
            return StatusCheck::new(S::Current, R::NeverExpires);
        };

        let now = match self.clock.monotonic() {
            Ok(now) => now,
            Err(e) => {
                warn!("unable to read the clock: {}", e);
                return StatusCheck::new(S::Error, R::ClockUnavailable);
            }
        };

        let elapsed = now.nanos_since(record.last_success);
        let window_ns = window.as_nanos() as i128;

        if self.clock.is_monotonic() && elapsed < -(FUTURE_TOLERANCE.as_nanos() as i128) {
            warn!("ignoring time stamp from the future ({})", record.last_success);
            disable(store, slot.offset, &mut record);
            return StatusCheck::new(S::Old, R::FromFuture);
        }
        if elapsed >= window_ns {
            return StatusCheck::new(S::Old, R::Expired);
        }
        // Without a monotonic clock a wall clock step can make any record
        // look fresh. Half the lead is compared against the window; this is a
        // coarse heuristic and not a security boundary.
        if !self.clock.is_monotonic() && elapsed < 0 && (-elapsed) / 2 > window_ns {
            warn!("time stamp too far in the future: {}", record.last_success);
            disable(store, slot.offset, &mut record);
            return StatusCheck::new(S::Old, R::TooFarAhead);
        }
        StatusCheck::new(S::Current, R::Fresh)
    }

    /// Stamp `key` with the current time and write it to `slot`
    pub fn update(
        &self,
        store: &RecordStore<'_>,
        slot: RecordSlot,
        key: &Record,
    ) -> StampResult<Record> {
        if self.timeout == Timeout::Disabled {
            return Err(StampError::TimestampsDisabled);
        }

        if let (Some(kernel), Some(window)) = (self.kernel, self.timeout.window()) {
            match kernel.set(window) {
                Ok(true) => {
                    debug!("set kernel ticket for {:?}", window);
                    return Ok(*key);
                }
                Ok(false) => debug!("kernel ticket unsupported, using file"),
                Err(e) => debug!("unable to set kernel ticket: {}", e),
            }
        }

        let now = self.clock.monotonic().map_err(StampError::Clock)?;
        let mut record = *key;
        record.flags.remove(RecordFlags::DISABLED);
        record.last_success = now;

        let _guard = if slot.locked {
            None
        } else {
            Some(RegionGuard::acquire(
                store.file(),
                slot.offset,
                SLOT_LEN,
                LockMode::Wait,
            )?)
        };
        store.write_at(Slot::At(slot.offset), &record)?;
        debug!("stamped {} record at {} with {}", record.kind.name(), slot.offset, now);
        Ok(record)
    }
}

fn disable(store: &RecordStore<'_>, offset: u64, record: &mut Record) {
    record.flags.insert(RecordFlags::DISABLED);
    if let Err(e) = store.write_at(Slot::At(offset), record) {
        warn!("unable to disable time stamp record at {}: {}", offset, e);
    }
}
