//! Fixed-size binary time stamp record
//!
//! Records are written verbatim in host byte order; a cache file is never
//! expected to move between machines.
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0 | 2 | format version |
//! | 2 | 2 | declared size |
//! | 4 | 2 | kind tag |
//! | 6 | 2 | flags |
//! | 8 | 4 | authenticated uid |
//! | 12 | 4 | session id |
//! | 16 | 16 | discriminant start time |
//! | 32 | 16 | last successful authentication |
//! | 48 | 8 | terminal device or parent pid |

use crate::stamp::clock::Timespec;
use std::fmt;
use thiserror::Error;

/// Size of every record on disk
pub const RECORD_SIZE: usize = 56;

/// Current on-disk format version
pub const RECORD_VERSION: u16 = 2;

const HEADER_LEN: usize = 6;

const TAG_GLOBAL: u16 = 1;
const TAG_TERMINAL: u16 = 2;
const TAG_PARENT: u16 = 3;
const TAG_LEADER: u16 = 4;

const OFF_VERSION: usize = 0;
const OFF_SIZE: usize = 2;
const OFF_KIND: usize = 4;
const OFF_FLAGS: usize = 6;
const OFF_UID: usize = 8;
const OFF_SID: usize = 12;
const OFF_START: usize = 16;
const OFF_STAMP: usize = 32;
const OFF_ID: usize = 48;

/// Errors decoding a record buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated record: got {len} of {expected} bytes")]
    Truncated { len: usize, expected: usize },

    #[error("unknown record kind {tag}")]
    UnknownKind { tag: u16 },
}

/// Record flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RecordFlags(u16);

impl RecordFlags {
    /// Invalidated manually (logout) or after tamper detection
    pub const DISABLED: RecordFlags = RecordFlags(0x01);
    /// Lookup key that matches records of any uid
    pub const ANY_UID: RecordFlags = RecordFlags(0x02);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RecordFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RecordFlags) {
        self.0 &= !other.0;
    }
}

/// What a record is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// First record of every file; only its lock byte range matters
    LeaderLock,
    /// One per file, valid in any session of the user
    Global,
    /// Bound to a parent process and that process's start time
    ParentProcess { pid: i32, start_time: Timespec },
    /// Bound to a terminal device and its session leader's start time
    Terminal { device: u64, leader_start: Timespec },
}

impl RecordKind {
    fn tag(&self) -> u16 {
        match self {
            Self::LeaderLock => TAG_LEADER,
            Self::Global => TAG_GLOBAL,
            Self::ParentProcess { .. } => TAG_PARENT,
            Self::Terminal { .. } => TAG_TERMINAL,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LeaderLock => "leader",
            Self::Global => "global",
            Self::ParentProcess { .. } => "ppid",
            Self::Terminal { .. } => "tty",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParentProcess { pid, start_time } => write!(f, "ppid {} (started {})", pid, start_time),
            Self::Terminal {
                device,
                leader_start,
            } => write!(f, "tty {:#x} (leader started {})", device, leader_start),
            other => f.write_str(other.name()),
        }
    }
}

/// Header fields readable from any buffer of at least six bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u16,
    pub declared_size: u16,
    pub tag: u16,
}

impl RecordHeader {
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            version: read_u16(buf, OFF_VERSION),
            declared_size: read_u16(buf, OFF_SIZE),
            tag: read_u16(buf, OFF_KIND),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.tag == TAG_LEADER
    }
}

/// One time stamp record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub version: u16,
    pub declared_size: u16,
    pub flags: RecordFlags,
    pub kind: RecordKind,
    pub auth_uid: u32,
    pub session_id: i32,
    pub last_success: Timespec,
}

impl Record {
    /// A fresh leader record
    pub fn leader() -> Self {
        Self {
            version: RECORD_VERSION,
            declared_size: RECORD_SIZE as u16,
            flags: RecordFlags::empty(),
            kind: RecordKind::LeaderLock,
            auth_uid: 0,
            session_id: 0,
            last_success: Timespec::ZERO,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.flags.contains(RecordFlags::DISABLED)
    }

    /// Whether the version and declared size are the ones this codec writes
    pub fn is_current_format(&self) -> bool {
        self.version == RECORD_VERSION && usize::from(self.declared_size) == RECORD_SIZE
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        write_bytes(&mut buf, OFF_VERSION, &self.version.to_ne_bytes());
        write_bytes(&mut buf, OFF_SIZE, &self.declared_size.to_ne_bytes());
        write_bytes(&mut buf, OFF_KIND, &self.kind.tag().to_ne_bytes());
        write_bytes(&mut buf, OFF_FLAGS, &self.flags.bits().to_ne_bytes());
        write_bytes(&mut buf, OFF_UID, &self.auth_uid.to_ne_bytes());
        write_bytes(&mut buf, OFF_SID, &self.session_id.to_ne_bytes());
        write_timespec(&mut buf, OFF_STAMP, self.last_success);

        match self.kind {
            RecordKind::LeaderLock | RecordKind::Global => {}
            RecordKind::ParentProcess { pid, start_time } => {
                write_timespec(&mut buf, OFF_START, start_time);
                write_bytes(&mut buf, OFF_ID, &i64::from(pid).to_ne_bytes());
            }
            RecordKind::Terminal {
                device,
                leader_start,
            } => {
                write_timespec(&mut buf, OFF_START, leader_start);
                write_bytes(&mut buf, OFF_ID, &device.to_ne_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < RECORD_SIZE {
            return Err(DecodeError::Truncated {
                len: buf.len(),
                expected: RECORD_SIZE,
            });
        }

        let start = read_timespec(buf, OFF_START);
        let kind = match read_u16(buf, OFF_KIND) {
            TAG_LEADER => RecordKind::LeaderLock,
            TAG_GLOBAL => RecordKind::Global,
            TAG_PARENT => RecordKind::ParentProcess {
                // Only the low 32 bits carry a pid; anything else is garbage
                // that simply fails to match.
                pid: read_i64(buf, OFF_ID) as i32,
                start_time: start,
            },
            TAG_TERMINAL => RecordKind::Terminal {
                device: read_u64(buf, OFF_ID),
                leader_start: start,
            },
            tag => return Err(DecodeError::UnknownKind { tag }),
        };

        Ok(Self {
            version: read_u16(buf, OFF_VERSION),
            declared_size: read_u16(buf, OFF_SIZE),
            flags: RecordFlags::from_bits(read_u16(buf, OFF_FLAGS)),
            kind,
            auth_uid: read_u32(buf, OFF_UID),
            session_id: read_i32(buf, OFF_SID),
            last_success: read_timespec(buf, OFF_STAMP),
        })
    }

    /// Whether this record is the one `key` is looking for.
    ///
    /// Compares version, uid (unless the key matches any uid), kind and the
    /// kind's discriminant. The time stamp and session id never take part,
    /// and the leader record never matches.
    pub fn matches_key(&self, key: &Record) -> bool {
        if self.version != key.version {
            return false;
        }
        if !key.flags.contains(RecordFlags::ANY_UID) && self.auth_uid != key.auth_uid {
            return false;
        }
        match (&self.kind, &key.kind) {
            (RecordKind::Global, RecordKind::Global) => true,
            (
                RecordKind::ParentProcess { pid, start_time },
                RecordKind::ParentProcess {
                    pid: want_pid,
                    start_time: want_start,
                },
            ) => pid == want_pid && start_time == want_start,
            (
                RecordKind::Terminal {
                    device,
                    leader_start,
                },
                RecordKind::Terminal {
                    device: want_device,
                    leader_start: want_start,
                },
            ) => device == want_device && leader_start == want_start,
            _ => false,
        }
    }
}

/// Rewrite a foreign first record as a leader record in place.
///
/// Version and declared size are kept; everything after the kind field is
/// zeroed.
pub fn convert_to_leader(buf: &mut [u8; RECORD_SIZE]) {
    write_bytes(buf, OFF_KIND, &TAG_LEADER.to_ne_bytes());
    buf[OFF_FLAGS..].fill(0);
}

fn write_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn write_timespec(buf: &mut [u8], offset: usize, ts: Timespec) {
    write_bytes(buf, offset, &ts.sec.to_ne_bytes());
    write_bytes(buf, offset + 8, &ts.nsec.to_ne_bytes());
}

fn array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes(array(buf, offset))
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(array(buf, offset))
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_ne_bytes(array(buf, offset))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(array(buf, offset))
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_ne_bytes(array(buf, offset))
}

fn read_timespec(buf: &[u8], offset: usize) -> Timespec {
    Timespec {
        sec: read_i64(buf, offset),
        nsec: read_i64(buf, offset + 8),
    }
}
