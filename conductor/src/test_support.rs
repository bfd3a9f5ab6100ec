//! Test-only helpers: scratch roots, hand-written lock files, and scripted
//! stand-ins for the executor command.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::core::lock::{LockInfo, LockType, lock_file_name};
use crate::io::config::{ConductorConfig, ProjectConfig, write_config};
use crate::io::init::{InitOptions, RootPaths, init_root};

/// A scaffolded coordination root that lives as long as the value.
pub struct TestRoot {
    pub dir: TempDir,
    pub paths: RootPaths,
}

impl TestRoot {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Create a temp root with default config and all directories.
pub fn scaffold_root() -> TestRoot {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = init_root(dir.path(), &InitOptions { force: false }).expect("init root");
    TestRoot { dir, paths }
}

/// Create a temp root whose config is `config`.
pub fn scaffold_root_with(config: &ConductorConfig) -> TestRoot {
    let dir = tempfile::tempdir().expect("tempdir");
    write_config(&dir.path().join(crate::io::init::CONFIG_FILE), config).expect("write config");
    let paths = init_root(dir.path(), &InitOptions { force: false }).expect("init root");
    TestRoot { dir, paths }
}

/// Config whose executor runs `script` through `sh -c`.
///
/// The rendered prompt is appended as the last argument and lands in `$0`.
pub fn scripted_executor(config: &mut ConductorConfig, script: &str) {
    config.executor.command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
}

/// Register project `name` with `workspace` as both workspace and repo.
pub fn add_project(config: &mut ConductorConfig, name: &str, workspace: &Path) {
    config.projects.insert(
        name.to_string(),
        ProjectConfig {
            workspace: workspace.to_path_buf(),
            base_branch: "main".to_string(),
            repo: None,
        },
    );
}

/// Write a lock file directly, bypassing the manager.
pub fn write_lock_file(
    locks_dir: &Path,
    lock_type: LockType,
    resource: &str,
    pid: u32,
    hostname: &str,
    acquired_at: DateTime<Utc>,
    owner: &str,
) -> PathBuf {
    let info = LockInfo {
        pid,
        hostname: hostname.to_string(),
        acquired_at,
        resource: resource.to_string(),
        lock_type,
        goal_id: None,
        project: None,
        owner: Some(owner.to_string()),
    };
    fs::create_dir_all(locks_dir).expect("create locks dir");
    let path = locks_dir.join(lock_file_name(lock_type, resource));
    fs::write(&path, serde_json::to_vec_pretty(&info).expect("json")).expect("write lock");
    path
}

/// Pid of a process that has already exited and been reaped.
#[cfg(unix)]
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait true");
    pid
}
