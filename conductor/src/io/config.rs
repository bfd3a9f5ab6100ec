//! Coordinator configuration stored in `<root>/conductor.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::lock::LockType;

/// Coordinator configuration (TOML).
///
/// Edited by humans. Missing fields fall back to defaults so an absent file
/// is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// History directory is `.<history_namespace>/` under the root.
    pub history_namespace: String,

    /// Goal tree directory, relative to the root.
    pub goals_dir: String,

    pub locks: LockConfig,
    pub executor: ExecutorConfig,
    pub watcher: WatcherConfig,

    /// Known projects by name.
    pub projects: BTreeMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Age after which any lock may be stolen.
    pub stale_after_secs: u64,

    /// Sleep between acquisition attempts while waiting.
    pub retry_interval_ms: u64,

    /// Per-type overrides of the default acquisition timeout, in seconds.
    pub timeouts: BTreeMap<LockType, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program and leading arguments for the agent process (e.g. `["claude"]`).
    pub command: Vec<String>,

    /// Upper bound on bytes of captured output attached to a stop event.
    pub output_tail_bytes: usize,

    /// Upper bound on lines of captured output attached to a stop event.
    pub output_tail_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatcherConfig {
    /// Repeated events for one path inside this window collapse to one.
    pub debounce_ms: u64,

    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Directory holding the project's goal worktrees.
    pub workspace: PathBuf,

    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Main checkout used for `git worktree`; defaults to `workspace`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<PathBuf>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 10 * 60,
            retry_interval_ms: 100,
            timeouts: BTreeMap::new(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            output_tail_bytes: 4_000,
            output_tail_lines: 40,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            poll_interval_ms: 200,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            history_namespace: "history".to_string(),
            goals_dir: "goals".to_string(),
            locks: LockConfig::default(),
            executor: ExecutorConfig::default(),
            watcher: WatcherConfig::default(),
            projects: BTreeMap::new(),
        }
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Configured timeout for `lock_type`, falling back to the type default.
    pub fn timeout_for(&self, lock_type: LockType) -> Duration {
        self.timeouts
            .get(&lock_type)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| lock_type.default_timeout())
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_namespace.trim().is_empty()
            || self.history_namespace.contains(['/', '\\'])
        {
            return Err(anyhow!("history_namespace must be a plain non-empty name"));
        }
        if self.goals_dir.trim().is_empty() {
            return Err(anyhow!("goals_dir must not be empty"));
        }
        if self.locks.stale_after_secs == 0 {
            return Err(anyhow!("locks.stale_after_secs must be > 0"));
        }
        if self.locks.retry_interval_ms == 0 {
            return Err(anyhow!("locks.retry_interval_ms must be > 0"));
        }
        if self.executor.command.is_empty() || self.executor.command[0].trim().is_empty() {
            return Err(anyhow!("executor.command must be a non-empty array"));
        }
        if self.watcher.debounce_ms == 0 || self.watcher.poll_interval_ms == 0 {
            return Err(anyhow!("watcher intervals must be > 0"));
        }
        for (name, project) in &self.projects {
            if project.workspace.as_os_str().is_empty() {
                return Err(anyhow!("projects.{name}.workspace must not be empty"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
