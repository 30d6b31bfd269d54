//! Job specification submitted by callers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Attack strategy understood by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum AttackMode {
    /// Straight dictionary attack, optionally with rules (`-a 0`).
    Dictionary,
    /// Concatenation of words from two wordlists (`-a 1`).
    Combinator,
    /// Mask / brute-force attack (`-a 3`).
    Mask,
    /// Wordlist followed by mask (`-a 6`).
    HybridWordlistMask,
    /// Mask followed by wordlist (`-a 7`).
    HybridMaskWordlist,
}

impl AttackMode {
    /// Numeric engine code.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Dictionary => 0,
            Self::Combinator => 1,
            Self::Mask => 3,
            Self::HybridWordlistMask => 6,
            Self::HybridMaskWordlist => 7,
        }
    }
}

impl TryFrom<u8> for AttackMode {
    type Error = AppError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Dictionary),
            1 => Ok(Self::Combinator),
            3 => Ok(Self::Mask),
            6 => Ok(Self::HybridWordlistMask),
            7 => Ok(Self::HybridMaskWordlist),
            other => Err(AppError::InvalidJobSpec(format!(
                "unknown attack mode code {other}"
            ))),
        }
    }
}

impl From<AttackMode> for u8 {
    fn from(mode: AttackMode) -> Self {
        mode.code()
    }
}

/// Hash material to attack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashTarget {
    /// Existing file containing one hash per line.
    File(PathBuf),
    /// Digests supplied directly by the caller.
    Inline(Vec<String>),
}

/// Caller-supplied cracking request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct JobSpec {
    /// Hash material.
    pub target: HashTarget,
    /// Engine hash-type code (`-m`).
    pub hash_type: u32,
    /// Attack mode (`-a`).
    pub attack_mode: AttackMode,
    /// Wordlist names relative to the configured wordlists directory.
    #[serde(default)]
    pub wordlists: Vec<String>,
    /// Rule file names relative to the configured rules directory.
    #[serde(default)]
    pub rules: Vec<String>,
    /// Mask for mask and hybrid attacks.
    #[serde(default)]
    pub mask: Option<String>,
    /// Higher values are admitted first; FIFO within equal priority.
    #[serde(default)]
    pub priority: Option<i32>,
    /// 1-based compute device ids (`-d`).
    #[serde(default)]
    pub devices: Option<Vec<u32>>,
}

/// Immutable job record; never mutated after submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    /// Unique job identifier.
    pub id: String,
    /// Requested work.
    pub spec: JobSpec,
    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    /// Wrap a spec with a generated identifier.
    #[must_use]
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            spec,
            submitted_at: Utc::now(),
        }
    }

    /// Effective admission priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.spec.priority.unwrap_or(0)
    }
}
