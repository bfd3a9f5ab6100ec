//! Durable per-goal history under `<root>/.<namespace>/goal-<id>.jsonl`.
//!
//! The log is append-only, one JSON object per line. An in-memory cache is
//! authoritative once a goal has been loaded; after a restart it is rebuilt
//! lazily from the file on first read.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::history::{GoalSession, HistoryEntry, entries_for_session, sessions_from_entries};
use crate::core::lock::sanitize_resource;

#[derive(Debug)]
pub struct HistoryLog {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Vec<HistoryEntry>>>,
}

impl HistoryLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn goal_path(&self, goal_id: &str) -> PathBuf {
        self.dir
            .join(format!("goal-{}.jsonl", sanitize_resource(goal_id)))
    }

    /// Append `entry` to the goal's log and, if loaded, to its cache.
    pub fn append(&self, goal_id: &str, entry: &HistoryEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("serialize history entry")?;
        line.push('\n');

        // Holding the cache lock keeps file order and cache order identical.
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create history dir {}", self.dir.display()))?;
        let path = self.goal_path(goal_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;

        if let Some(entries) = cache.get_mut(goal_id) {
            entries.push(entry.clone());
        }
        debug!(goal_id, path = %path.display(), "history entry appended");
        Ok(())
    }

    /// Every entry for a goal, in log order.
    pub fn goal_history(&self, goal_id: &str) -> Result<Vec<HistoryEntry>> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entries) = cache.get(goal_id) {
                return Ok(entries.clone());
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = cache.get(goal_id) {
            return Ok(entries.clone());
        }
        let loaded = load_entries(&self.goal_path(goal_id))?;
        debug!(goal_id, entries = loaded.len(), "history cache rebuilt from log");
        cache.insert(goal_id.to_string(), loaded.clone());
        Ok(loaded)
    }

    /// Session summaries for a goal, oldest first.
    pub fn goal_sessions(&self, goal_id: &str) -> Result<Vec<GoalSession>> {
        Ok(sessions_from_entries(&self.goal_history(goal_id)?))
    }

    /// Entries for one session of a goal.
    pub fn session_history(&self, goal_id: &str, session_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(entries_for_session(&self.goal_history(goal_id)?, session_id))
    }
}

fn load_entries(path: &Path) -> Result<Vec<HistoryEntry>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };

    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(path = %path.display(), line = idx + 1, err = %e, "skipping unreadable history line");
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn start(session_id: &str) -> HistoryEntry {
        HistoryEntry::SessionStart {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            cwd: "/w/goal-g1-x".to_string(),
            user: "alice".to_string(),
            executor_type: None,
            project: None,
        }
    }

    fn stop(session_id: &str) -> HistoryEntry {
        HistoryEntry::SessionStop {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            reason: "completed".to_string(),
            claude_session_id: Some("c-1".to_string()),
            transcript_path: Some("/t.jsonl".to_string()),
            output_tail: None,
        }
    }

    #[test]
    fn fresh_log_rebuilds_sessions_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join(".history");

        let log = HistoryLog::new(&dir);
        log.append("g1", &start("s1")).expect("append");
        log.append("g1", &stop("s1")).expect("append");
        let before = log.goal_sessions("g1").expect("sessions");

        let restarted = HistoryLog::new(&dir);
        let after = restarted.goal_sessions("g1").expect("sessions");
        assert_eq!(before, after);
        assert_eq!(after[0].claude_session_id.as_deref(), Some("c-1"));
        assert!(dir.join("goal-g1.jsonl").is_file());
    }

    #[test]
    fn cache_tracks_appends_after_first_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = HistoryLog::new(temp.path());
        assert!(log.goal_history("g1").expect("empty").is_empty());

        log.append("g1", &start("s1")).expect("append");
        log.append("g1", &start("s2")).expect("append");
        assert_eq!(log.goal_history("g1").expect("history").len(), 2);
        assert_eq!(log.session_history("g1", "s2").expect("s2").len(), 1);
    }

    #[test]
    fn unreadable_lines_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = HistoryLog::new(temp.path());
        log.append("g1", &start("s1")).expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.goal_path("g1"))
            .expect("open");
        file.write_all(b"{garbage\n").expect("write");
        log.append("g1", &stop("s1")).expect("append");

        let restarted = HistoryLog::new(temp.path());
        assert_eq!(restarted.goal_history("g1").expect("history").len(), 2);
    }
}
