//! Side-effecting operations: lock files, history log, config, git, and
//! child processes.

pub mod config;
pub mod git;
pub mod goal;
pub mod history;
pub mod init;
pub mod lock;
pub mod process;
pub mod project;
pub mod prompt;
pub mod worktree;
