//! File-backed advisory locks under `<root>/.locks/`.
//!
//! A lock is one JSON file per `(lock_type, resource)` pair. Creation is
//! all-or-nothing: the record is written to a private temp file and then
//! hard-linked into place, which fails if the lock file already exists. A
//! reader therefore never observes a half-written lock.
//!
//! Conditional removal (stealing a stale lock, cleaning, releasing our own)
//! goes through `remove_if`. The decision is made on a plain read, so a live
//! lock is never touched. Deletion then happens under a per-lock reap guard
//! (`.<name>.reap`, created exclusively), after a second read. Acquirers only
//! ever create into an empty path, so with every remover serialized on the
//! guard the record read under it is the record deleted.
//!
//! The files are the only cross-process synchronization primitive. Waiting
//! is a sleep/retry loop with no FIFO guarantee.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::config::LockConfig;
use super::process::{hostname, is_process_alive};
use crate::core::lock::{
    LockInfo, LockRequest, LockType, StaleReason, lock_file_name, stale_reason,
};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How long a remover waits for another remover's guard.
const REAP_GUARD_WAIT: Duration = Duration::from_millis(500);
/// A guard older than this was left by a crashed remover.
const REAP_GUARD_ABANDONED: Duration = Duration::from_secs(10);

/// Structured lock failures. Contention is expected and never fatal.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{lock_type} lock on '{resource}' is held by {}", .holder.holder())]
    Held {
        lock_type: LockType,
        resource: String,
        holder: LockInfo,
    },
    #[error(
        "timed out after {:.1}s waiting for {lock_type} lock on '{resource}' (held by {})",
        .waited.as_secs_f64(),
        describe_holder(.holder.as_ref())
    )]
    Timeout {
        lock_type: LockType,
        resource: String,
        waited: Duration,
        holder: Option<LockInfo>,
    },
    #[error("{lock_type} lock on '{resource}' changed hands while acquiring")]
    Contended { lock_type: LockType, resource: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

fn describe_holder(holder: Option<&LockInfo>) -> String {
    holder
        .map(LockInfo::holder)
        .unwrap_or_else(|| "unknown holder".to_string())
}

/// A lock held by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub info: LockInfo,
    pub path: PathBuf,
}

/// One entry of [`LockManager::list_locks`].
#[derive(Debug, Clone, Serialize)]
pub struct ListedLock {
    pub file_name: String,
    /// `None` if the file could not be parsed.
    pub info: Option<LockInfo>,
    pub stale: Option<StaleReason>,
}

enum LockFile {
    Missing,
    Corrupt,
    Parsed(LockInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Removed,
    Kept,
    /// Another remover held the reap guard for the whole wait.
    Busy,
}

struct ReapGuard {
    path: PathBuf,
}

impl Drop for ReapGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), err = %e, "failed to remove reap guard"),
        }
    }
}

/// Acquires and releases locks in one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    locks_dir: PathBuf,
    hostname: String,
    config: LockConfig,
}

impl LockManager {
    pub fn new(locks_dir: impl Into<PathBuf>, config: &LockConfig) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            hostname: hostname().to_string(),
            config: config.clone(),
        }
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    pub fn lock_path(&self, lock_type: LockType, resource: &str) -> PathBuf {
        self.locks_dir.join(lock_file_name(lock_type, resource))
    }

    /// Timeout used by [`LockManager::acquire_default`] for `lock_type`.
    pub fn default_timeout(&self, lock_type: LockType) -> Duration {
        self.config.timeout_for(lock_type)
    }

    /// Single acquisition attempt; no waiting.
    ///
    /// A stale existing lock is stolen and creation retried once. Losing that
    /// recreate race to another acquirer reports the winner as the holder.
    #[instrument(skip_all, fields(lock_type = %lock_type, resource = %resource))]
    pub fn try_acquire(
        &self,
        lock_type: LockType,
        resource: &str,
        request: &LockRequest,
    ) -> Result<Lock, LockError> {
        fs::create_dir_all(&self.locks_dir)
            .with_context(|| format!("create locks dir {}", self.locks_dir.display()))?;
        let path = self.lock_path(lock_type, resource);

        for attempt in 0..2 {
            let info = self.new_info(lock_type, resource, request);
            if self.create_exclusive(&path, &info)? {
                debug!(path = %path.display(), "lock acquired");
                return Ok(Lock { info, path });
            }

            match read_lock_file(&path)? {
                LockFile::Missing => continue,
                LockFile::Corrupt => {
                    warn!(path = %path.display(), "stealing unreadable lock file");
                    if self.remove_if(&path, |file| matches!(file, LockFile::Corrupt))?
                        == Removal::Busy
                    {
                        return Err(LockError::Contended {
                            lock_type,
                            resource: resource.to_string(),
                        });
                    }
                }
                LockFile::Parsed(existing) => {
                    let Some(reason) = self.stale_reason(&existing) else {
                        return Err(LockError::Held {
                            lock_type,
                            resource: resource.to_string(),
                            holder: existing,
                        });
                    };
                    if attempt > 0 {
                        return Err(LockError::Held {
                            lock_type,
                            resource: resource.to_string(),
                            holder: existing,
                        });
                    }
                    info!(
                        path = %path.display(),
                        holder = %existing.holder(),
                        ?reason,
                        "stealing stale lock"
                    );
                    let removal = self.remove_if(&path, |file| match file {
                        LockFile::Parsed(current) => self.stale_reason(current).is_some(),
                        LockFile::Corrupt => true,
                        LockFile::Missing => false,
                    })?;
                    if removal == Removal::Busy {
                        return Err(LockError::Contended {
                            lock_type,
                            resource: resource.to_string(),
                        });
                    }
                }
            }
        }

        // Another acquirer won the recreate race.
        match read_lock_file(&path)? {
            LockFile::Parsed(holder) => Err(LockError::Held {
                lock_type,
                resource: resource.to_string(),
                holder,
            }),
            LockFile::Missing | LockFile::Corrupt => Err(LockError::Contended {
                lock_type,
                resource: resource.to_string(),
            }),
        }
    }

    /// Retry [`LockManager::try_acquire`] every retry interval until success or `timeout`.
    ///
    /// Never returns a timeout before `timeout` has elapsed.
    #[instrument(skip_all, fields(lock_type = %lock_type, resource = %resource, timeout_ms = timeout.as_millis() as u64))]
    pub fn acquire(
        &self,
        lock_type: LockType,
        resource: &str,
        timeout: Duration,
        request: &LockRequest,
    ) -> Result<Lock, LockError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last_holder = None;

        loop {
            match self.try_acquire(lock_type, resource, request) {
                Ok(lock) => return Ok(lock),
                Err(LockError::Held { holder, .. }) => last_holder = Some(holder),
                Err(LockError::Contended { .. }) => {}
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    holder = %describe_holder(last_holder.as_ref()),
                    "lock acquisition timed out"
                );
                return Err(LockError::Timeout {
                    lock_type,
                    resource: resource.to_string(),
                    waited: started.elapsed(),
                    holder: last_holder,
                });
            }
            thread::sleep(self.config.retry_interval().min(deadline - now));
        }
    }

    /// [`LockManager::acquire`] with the configured timeout for `lock_type`.
    pub fn acquire_default(
        &self,
        lock_type: LockType,
        resource: &str,
        request: &LockRequest,
    ) -> Result<Lock, LockError> {
        self.acquire(lock_type, resource, self.default_timeout(lock_type), request)
    }

    /// Remove `lock`'s file if it still records this acquisition.
    ///
    /// Idempotent. After a forced release or a theft this is a no-op. Returns
    /// whether a file was removed; I/O failures are logged, never raised.
    pub fn release(&self, lock: &Lock) -> bool {
        match self.remove_if(&lock.path, |file| {
            matches!(file, LockFile::Parsed(current) if current.same_holder(&lock.info))
        }) {
            Ok(Removal::Busy) => {
                warn!(path = %lock.path.display(), "lock left in place, reap guard busy");
                false
            }
            Ok(removal) => {
                let removed = removal == Removal::Removed;
                debug!(path = %lock.path.display(), removed, "lock released");
                removed
            }
            Err(err) => {
                warn!(path = %lock.path.display(), err = %err, "failed to release lock");
                false
            }
        }
    }

    /// Remove the lock file unconditionally.
    pub fn force_release(&self, lock_type: LockType, resource: &str) -> Result<bool> {
        let path = self.lock_path(lock_type, resource);
        // Forced removal goes ahead even if the guard stays busy.
        let _guard = self.reap_guard(&path)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "lock force-released");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    /// All lock files with their parsed contents and staleness.
    pub fn list_locks(&self) -> Result<Vec<ListedLock>> {
        let mut locks = Vec::new();
        for path in self.lock_files()? {
            let file_name = file_name_of(&path);
            let listed = match read_lock_file(&path)? {
                LockFile::Missing => continue,
                LockFile::Corrupt => ListedLock {
                    file_name,
                    info: None,
                    stale: Some(StaleReason::Unreadable),
                },
                LockFile::Parsed(info) => ListedLock {
                    file_name,
                    stale: self.stale_reason(&info),
                    info: Some(info),
                },
            };
            locks.push(listed);
        }
        Ok(locks)
    }

    /// Remove every stale lock; returns how many were removed.
    pub fn clean_stale_locks(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.lock_files()? {
            let removal = self.remove_if(&path, |file| match file {
                LockFile::Parsed(info) => self.stale_reason(info).is_some(),
                LockFile::Corrupt => true,
                LockFile::Missing => false,
            })?;
            match removal {
                Removal::Removed => {
                    info!(path = %path.display(), "removed stale lock");
                    removed += 1;
                }
                Removal::Busy => debug!(path = %path.display(), "skipped, reap guard busy"),
                Removal::Kept => {}
            }
        }
        Ok(removed)
    }

    /// Acquire, run `f`, and always release. Acquisition failure skips `f`.
    pub fn with_lock<T>(
        &self,
        lock_type: LockType,
        resource: &str,
        timeout: Duration,
        request: &LockRequest,
        f: impl FnOnce(&Lock) -> Result<T>,
    ) -> Result<T> {
        let lock = self.acquire(lock_type, resource, timeout, request)?;
        let result = f(&lock);
        self.release(&lock);
        result
    }

    /// Staleness of `info` as judged from this host, now.
    pub fn stale_reason(&self, info: &LockInfo) -> Option<StaleReason> {
        stale_reason(
            info,
            Utc::now(),
            self.config.stale_after(),
            &self.hostname,
            is_process_alive,
        )
    }

    fn new_info(&self, lock_type: LockType, resource: &str, request: &LockRequest) -> LockInfo {
        LockInfo {
            pid: request.pid.unwrap_or_else(std::process::id),
            hostname: self.hostname.clone(),
            acquired_at: Utc::now(),
            resource: resource.to_string(),
            lock_type,
            goal_id: request.goal_id.clone(),
            project: request.project.clone(),
            owner: request.owner.clone(),
        }
    }

    /// Atomically create `path` with `info`. `Ok(false)` if it already exists.
    fn create_exclusive(&self, path: &Path, info: &LockInfo) -> Result<bool> {
        let tmp = self.scratch_path(path, "tmp");
        let mut payload = serde_json::to_string_pretty(info).context("serialize lock info")?;
        payload.push('\n');
        fs::write(&tmp, payload).with_context(|| format!("write {}", tmp.display()))?;

        let linked = fs::hard_link(&tmp, path);
        if let Err(e) = fs::remove_file(&tmp) {
            warn!(path = %tmp.display(), err = %e, "failed to remove lock temp file");
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("create lock {}", path.display())),
        }
    }

    /// Delete `path` if `should_remove` holds for its current contents.
    ///
    /// `should_remove` must reject [`LockFile::Missing`].
    fn remove_if(&self, path: &Path, should_remove: impl Fn(&LockFile) -> bool) -> Result<Removal> {
        if !should_remove(&read_lock_file(path)?) {
            return Ok(Removal::Kept);
        }
        let Some(_guard) = self.reap_guard(path)? else {
            return Ok(Removal::Busy);
        };
        // Another remover may have replaced the file before we got the guard.
        if !should_remove(&read_lock_file(path)?) {
            return Ok(Removal::Kept);
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(Removal::Removed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Removal::Kept),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    /// Exclusive right to delete `path`, waiting briefly for another remover.
    fn reap_guard(&self, path: &Path) -> Result<Option<ReapGuard>> {
        let guard_path = self.locks_dir.join(format!(".{}.reap", file_name_of(path)));
        let deadline = Instant::now() + REAP_GUARD_WAIT;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&guard_path)
            {
                Ok(_) => return Ok(Some(ReapGuard { path: guard_path })),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("create {}", guard_path.display()));
                }
            }

            if guard_abandoned(&guard_path) {
                warn!(path = %guard_path.display(), "removing abandoned reap guard");
                match fs::remove_file(&guard_path) {
                    Ok(()) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(e).with_context(|| format!("remove {}", guard_path.display()));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn scratch_path(&self, path: &Path, kind: &str) -> PathBuf {
        let name = file_name_of(path);
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.locks_dir
            .join(format!(".{name}.{}.{n}.{kind}", std::process::id()))
    }

    fn lock_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.locks_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.locks_dir.display()));
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "lock")
                    && !path
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn guard_abandoned(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > REAP_GUARD_ABANDONED)
}

fn read_lock_file(path: &Path) -> Result<LockFile> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockFile::Missing),
        Err(e) => return Err(e).with_context(|| format!("read lock file {}", path.display())),
    };
    match serde_json::from_str(&contents) {
        Ok(info) => Ok(LockFile::Parsed(info)),
        Err(_) => Ok(LockFile::Corrupt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn manager(dir: &Path) -> LockManager {
        let config = LockConfig {
            retry_interval_ms: 20,
            ..LockConfig::default()
        };
        LockManager::new(dir.join(".locks"), &config)
    }

    #[test]
    fn lock_file_records_holder_metadata() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());
        let request = LockRequest {
            owner: Some("alice".to_string()),
            goal_id: Some("g1".to_string()),
            project: Some("P".to_string()),
            pid: None,
        };
        let lock = locks
            .try_acquire(LockType::WorktreeBase, "P", &request)
            .expect("acquire");

        assert!(lock.path.ends_with(".locks/worktree-base-P.lock"));
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&lock.path).expect("read")).expect("json");
        assert_eq!(raw["pid"], std::process::id());
        assert_eq!(raw["lock_type"], "worktree-base");
        assert_eq!(raw["resource"], "P");
        assert_eq!(raw["owner"], "alice");
        assert_eq!(raw["goal_id"], "g1");
        assert!(raw["acquired_at"].as_str().is_some());
    }

    #[test]
    fn second_try_acquire_reports_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());
        let _held = locks
            .try_acquire(LockType::Merge, "P", &LockRequest::owner("alice"))
            .expect("acquire");

        let err = locks
            .try_acquire(LockType::Merge, "P", &LockRequest::owner("bob"))
            .expect_err("held");
        match err {
            LockError::Held { holder, .. } => assert_eq!(holder.owner.as_deref(), Some("alice")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn concurrent_try_acquire_has_exactly_one_winner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = Arc::new(manager(temp.path()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    locks
                        .try_acquire(
                            LockType::Branch,
                            "goal-g1",
                            &LockRequest::owner(format!("w{i}")),
                        )
                        .is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn release_is_idempotent_and_skips_foreign_locks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());
        let lock = locks
            .try_acquire(LockType::Registry, "registry", &LockRequest::default())
            .expect("acquire");

        assert!(locks.force_release(LockType::Registry, "registry").expect("force"));
        let other = locks
            .try_acquire(LockType::Registry, "registry", &LockRequest::owner("bob"))
            .expect("reacquire");

        assert!(!locks.release(&lock), "must not remove bob's lock");
        assert!(other.path.exists());
        assert!(locks.release(&other));
        assert!(!locks.release(&other));
        assert!(!locks.force_release(LockType::Registry, "registry").expect("force"));
    }

    #[test]
    fn dead_holder_lock_is_stolen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead_pid = child.id();
        child.wait().expect("wait");

        let path = locks.lock_path(LockType::Project, "P");
        fs::create_dir_all(locks.locks_dir()).expect("dir");
        let stale = LockInfo {
            pid: dead_pid,
            hostname: hostname().to_string(),
            acquired_at: Utc::now(),
            resource: "P".to_string(),
            lock_type: LockType::Project,
            goal_id: None,
            project: None,
            owner: Some("crashed".to_string()),
        };
        fs::write(&path, serde_json::to_string(&stale).expect("json")).expect("write");

        let lock = locks
            .try_acquire(LockType::Project, "P", &LockRequest::owner("bob"))
            .expect("steal");
        assert_eq!(lock.info.owner.as_deref(), Some("bob"));
    }

    #[test]
    fn expired_lock_is_stolen_even_from_live_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());
        let path = locks.lock_path(LockType::GoalState, "g1");
        fs::create_dir_all(locks.locks_dir()).expect("dir");
        let old = LockInfo {
            pid: std::process::id(),
            hostname: hostname().to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            resource: "g1".to_string(),
            lock_type: LockType::GoalState,
            goal_id: Some("g1".to_string()),
            project: None,
            owner: None,
        };
        fs::write(&path, serde_json::to_string(&old).expect("json")).expect("write");

        assert!(
            locks
                .try_acquire(LockType::GoalState, "g1", &LockRequest::default())
                .is_ok()
        );
    }

    #[test]
    fn unreadable_lock_file_is_stolen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());
        let path = locks.lock_path(LockType::Branch, "b");
        fs::create_dir_all(locks.locks_dir()).expect("dir");
        fs::write(&path, "not json").expect("write");

        assert!(
            locks
                .try_acquire(LockType::Branch, "b", &LockRequest::default())
                .is_ok()
        );
    }

    #[test]
    fn acquire_times_out_no_earlier_than_requested_and_names_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());
        let _held = locks
            .try_acquire(LockType::Merge, "P", &LockRequest::owner("alice"))
            .expect("acquire");

        let timeout = Duration::from_millis(300);
        let started = Instant::now();
        let err = locks
            .acquire(LockType::Merge, "P", timeout, &LockRequest::owner("bob"))
            .expect_err("timeout");
        let elapsed = started.elapsed();

        assert!(elapsed >= timeout, "returned early after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_millis(500), "overshot: {elapsed:?}");
        match err {
            LockError::Timeout { holder, .. } => {
                assert_eq!(holder.and_then(|h| h.owner).as_deref(), Some("alice"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn acquire_succeeds_once_holder_releases() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = Arc::new(manager(temp.path()));
        let held = locks
            .try_acquire(LockType::Branch, "b", &LockRequest::owner("alice"))
            .expect("acquire");

        let releaser = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                locks.release(&held);
            })
        };
        let lock = locks
            .acquire(
                LockType::Branch,
                "b",
                Duration::from_secs(5),
                &LockRequest::owner("bob"),
            )
            .expect("acquire after release");
        releaser.join().expect("join");
        assert_eq!(lock.info.owner.as_deref(), Some("bob"));
    }

    #[test]
    fn with_lock_releases_after_error_and_skips_when_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());

        let result: Result<()> = locks.with_lock(
            LockType::Project,
            "P",
            Duration::from_millis(50),
            &LockRequest::default(),
            |_| Err(anyhow::anyhow!("boom")),
        );
        assert!(result.is_err());
        assert!(!locks.lock_path(LockType::Project, "P").exists());

        let _held = locks
            .try_acquire(LockType::Project, "P", &LockRequest::owner("alice"))
            .expect("acquire");
        let mut ran = false;
        let result = locks.with_lock(
            LockType::Project,
            "P",
            Duration::from_millis(50),
            &LockRequest::default(),
            |_| {
                ran = true;
                Ok(())
            },
        );
        assert!(result.is_err());
        assert!(!ran);
    }

    #[test]
    fn list_and_clean_only_touch_stale_locks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());
        let _live = locks
            .try_acquire(LockType::Branch, "live", &LockRequest::default())
            .expect("acquire");
        fs::write(locks.lock_path(LockType::Branch, "junk"), "{").expect("write");

        let listed = locks.list_locks().expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(
            listed.iter().filter(|l| l.stale.is_some()).count(),
            1,
            "{listed:?}"
        );

        assert_eq!(locks.clean_stale_locks().expect("clean"), 1);
        let remaining = locks.list_locks().expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].file_name, "branch-live.lock");
    }

    #[test]
    fn cleaning_never_opens_a_window_on_a_live_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = Arc::new(manager(temp.path()));
        let alice = locks
            .try_acquire(LockType::WorktreeBase, "P", &LockRequest::owner("alice"))
            .expect("acquire");

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cleaner = {
            let locks = Arc::clone(&locks);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rounds = 0;
                while !stop.load(Ordering::Relaxed) {
                    assert_eq!(locks.clean_stale_locks().expect("clean"), 0);
                    rounds += 1;
                }
                rounds
            })
        };

        for _ in 0..500 {
            match locks.try_acquire(LockType::WorktreeBase, "P", &LockRequest::owner("bob")) {
                Err(LockError::Held { holder, .. }) => {
                    assert_eq!(holder.owner.as_deref(), Some("alice"));
                }
                Ok(lock) => panic!("bob acquired while alice holds: {:?}", lock.info),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        stop.store(true, Ordering::Relaxed);
        assert!(cleaner.join().expect("join") > 0);

        assert!(locks.release(&alice), "alice's file must survive cleaning");
    }

    #[test]
    fn abandoned_reap_guard_does_not_block_theft() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(temp.path());
        let path = locks.lock_path(LockType::Branch, "b");
        fs::create_dir_all(locks.locks_dir()).expect("dir");
        fs::write(&path, "not json").expect("write");

        let guard = locks.locks_dir().join(".branch-b.lock.reap");
        let file = fs::File::create(&guard).expect("guard");
        let old = std::time::SystemTime::now() - Duration::from_secs(60);
        file.set_modified(old).expect("set mtime");

        assert!(
            locks
                .try_acquire(LockType::Branch, "b", &LockRequest::default())
                .is_ok()
        );
        assert!(!guard.exists());
    }
}
