//! Lock identity, metadata, and the staleness rule.
//!
//! Everything here is pure: file naming, timeouts per lock type, and the
//! decision whether a recorded holder is still valid. The filesystem side
//! lives in [`crate::io::lock`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse category of shared resource guarded by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockType {
    /// Base checkout of a project that worktrees are created from.
    WorktreeBase,
    /// Creation of a single branch.
    Branch,
    /// Merging a goal branch back into the base branch.
    Merge,
    /// On-disk state of one goal.
    GoalState,
    /// Whole-project operations.
    Project,
    /// The goal registry file.
    Registry,
}

impl LockType {
    pub const ALL: [LockType; 6] = [
        LockType::WorktreeBase,
        LockType::Branch,
        LockType::Merge,
        LockType::GoalState,
        LockType::Project,
        LockType::Registry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LockType::WorktreeBase => "worktree-base",
            LockType::Branch => "branch",
            LockType::Merge => "merge",
            LockType::GoalState => "goal-state",
            LockType::Project => "project",
            LockType::Registry => "registry",
        }
    }

    /// Expected upper bound on how long a holder keeps this lock.
    pub fn default_timeout(self) -> Duration {
        match self {
            LockType::WorktreeBase => Duration::from_secs(60),
            LockType::Branch => Duration::from_secs(10),
            LockType::Merge => Duration::from_secs(120),
            LockType::GoalState => Duration::from_secs(10),
            LockType::Project => Duration::from_secs(30),
            LockType::Registry => Duration::from_secs(10),
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        LockType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow!("unknown lock type '{s}'"))
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub resource: String,
    pub lock_type: LockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl LockInfo {
    /// True if both records describe the same acquisition.
    pub fn same_holder(&self, other: &LockInfo) -> bool {
        self.pid == other.pid
            && self.hostname == other.hostname
            && self.acquired_at == other.acquired_at
    }

    /// Human-readable holder description for diagnostics.
    pub fn holder(&self) -> String {
        let owner = self.owner.as_deref().unwrap_or("unknown");
        format!(
            "{owner} (pid {} on {}) since {}",
            self.pid,
            self.hostname,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Caller-supplied attributes recorded in a new lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRequest {
    pub owner: Option<String>,
    pub goal_id: Option<String>,
    pub project: Option<String>,
    /// Process recorded as holder; defaults to the current process.
    pub pid: Option<u32>,
}

impl LockRequest {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::default()
        }
    }
}

/// Why an existing lock may be stolen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// Older than the staleness threshold.
    Expired,
    /// Recorded on this host by a process that no longer runs.
    HolderGone,
    /// File could not be parsed.
    Unreadable,
}

/// Map any character outside `[A-Za-z0-9_-]` to `-`.
pub fn sanitize_resource(resource: &str) -> String {
    resource
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// File name for a `(lock_type, resource)` pair.
pub fn lock_file_name(lock_type: LockType, resource: &str) -> String {
    format!("{}-{}.lock", lock_type.as_str(), sanitize_resource(resource))
}

/// Decide whether `info` no longer protects its resource.
///
/// Either signal alone suffices: age beyond `stale_after`, or a holder pid
/// that is not running. Liveness is only checked for locks recorded on
/// `this_host`; foreign locks expire by age.
pub fn stale_reason(
    info: &LockInfo,
    now: DateTime<Utc>,
    stale_after: Duration,
    this_host: &str,
    is_alive: impl Fn(u32) -> bool,
) -> Option<StaleReason> {
    let age = now.signed_duration_since(info.acquired_at);
    let expired = age
        .to_std()
        .map(|age| age > stale_after)
        .unwrap_or(false);
    if expired {
        return Some(StaleReason::Expired);
    }
    if info.hostname == this_host && !is_alive(info.pid) {
        return Some(StaleReason::HolderGone);
    }
    None
}
