//! Configuration schema for credstamp
//!
//! Configuration is stored at `/etc/credstamp/config.toml`

use crate::error::StampResult;
use crate::stamp::{Owner, ScopeMode, StampSettings, Timeout};
use crate::users::PasswdCache;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Time stamp cache settings
    pub timestamp: TimestampConfig,

    /// First-use notice settings
    pub lecture: LectureConfig,
}

impl Config {
    /// Resolve names and durations into the settings the cache works with
    pub fn settings(&self, users: &mut PasswdCache) -> StampResult<StampSettings> {
        let owner = users.lookup_name(&self.timestamp.owner)?;
        Ok(StampSettings {
            dir: self.timestamp.dir.clone(),
            owner: Owner {
                uid: owner.uid,
                gid: owner.gid,
            },
            timeout: Timeout::from_minutes(self.timestamp.timeout_minutes),
            scope: self.timestamp.scope,
            lecture_dir: self.lecture.dir.clone(),
        })
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,

    /// Where audit events are appended
    pub audit_log_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
            audit_log_path: PathBuf::from("/var/log/credstamp/audit.log"),
        }
    }
}

/// Time stamp cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    /// Directory holding one time stamp file per user
    pub dir: PathBuf,

    /// User that owns the directory and its files
    pub owner: String,

    /// Minutes an authentication stays valid (0 = never cache, negative =
    /// valid until invalidated)
    pub timeout_minutes: f64,

    /// Record scope: tty, ppid, global or kernel
    pub scope: ScopeMode,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/run/credstamp/ts"),
            owner: "root".to_string(),
            timeout_minutes: 5.0,
            scope: ScopeMode::Terminal,
        }
    }
}

/// First-use notice configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LectureConfig {
    /// Directory holding one marker file per lectured user
    pub dir: PathBuf,
}

impl Default for LectureConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/credstamp/lectured"),
        }
    }
}
