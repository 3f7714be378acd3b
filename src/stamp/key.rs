//! Lookup keys for time stamp records

use crate::stamp::clock::Timespec;
use crate::stamp::procinfo::OsFacts;
use crate::stamp::record::{Record, RecordFlags, RecordKind, RECORD_SIZE, RECORD_VERSION};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Granularity at which a successful authentication is remembered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeMode {
    /// Per controlling terminal (falls back to parent process without one)
    #[default]
    #[serde(rename = "tty")]
    Terminal,
    /// Per parent process
    #[serde(rename = "ppid")]
    ParentProcess,
    /// One record shared by all of the user's sessions
    #[serde(rename = "global")]
    Global,
    /// Kernel-held ticket when the platform offers one
    #[serde(rename = "kernel")]
    Kernel,
}

impl fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Terminal => "tty",
            Self::ParentProcess => "ppid",
            Self::Global => "global",
            Self::Kernel => "kernel",
        };
        write!(f, "{}", name)
    }
}

/// Builds lookup keys from live process facts
pub struct KeyBuilder<'a> {
    facts: &'a OsFacts,
    session_id: i32,
}

impl<'a> KeyBuilder<'a> {
    /// Keys stamped with the current session id
    pub fn new(facts: &'a OsFacts) -> Self {
        Self {
            facts,
            session_id: facts.session_id,
        }
    }

    /// Stamp keys with `session_id` instead of the current one
    pub fn with_session_id(mut self, session_id: i32) -> Self {
        self.session_id = session_id;
        self
    }

    /// Build a key for `mode`.
    ///
    /// `auth_uid` of `None` produces an administrative key matching records of
    /// any uid. Kernel mode keys on the parent process, since its real state
    /// lives outside the file.
    pub fn build(&self, auth_uid: Option<u32>, mode: ScopeMode) -> Record {
        let kind = match mode {
            ScopeMode::Global => RecordKind::Global,
            ScopeMode::Terminal => self.terminal_or_parent(),
            ScopeMode::ParentProcess | ScopeMode::Kernel => self.parent(),
        };

        let mut flags = RecordFlags::empty();
        if auth_uid.is_none() {
            flags.insert(RecordFlags::ANY_UID);
        }

        Record {
            version: RECORD_VERSION,
            declared_size: RECORD_SIZE as u16,
            flags,
            kind,
            auth_uid: auth_uid.unwrap_or(0),
            session_id: self.session_id,
            last_success: Timespec::ZERO,
        }
    }

    /// Key for the per-scope lock record.
    ///
    /// Global and kernel modes still lock per terminal (or parent) so that
    /// concurrent invocations in one pipeline serialize predictably.
    pub fn build_nonglobal(&self, auth_uid: Option<u32>, mode: ScopeMode) -> Record {
        let mode = match mode {
            ScopeMode::ParentProcess => ScopeMode::ParentProcess,
            _ => ScopeMode::Terminal,
        };
        self.build(auth_uid, mode)
    }

    fn terminal_or_parent(&self) -> RecordKind {
        match self.facts.terminal {
            Some(tty) => RecordKind::Terminal {
                device: tty.device,
                leader_start: tty.leader_start,
            },
            None => self.parent(),
        }
    }

    fn parent(&self) -> RecordKind {
        RecordKind::ParentProcess {
            pid: self.facts.parent.pid,
            start_time: self.facts.parent.start_time,
        }
    }
}
