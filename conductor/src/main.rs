//! `conductor` CLI: root scaffolding and lock administration.
//!
//! The hub service lives in `conductor-hub`; this binary is for operators and
//! scripts that need to inspect or hand-manage the shared lock directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use conductor::core::lock::{LockRequest, LockType};
use conductor::exit_codes;
use conductor::io::init::{InitOptions, RootPaths, init_root};
use conductor::io::lock::{ListedLock, LockError, LockManager};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Coordinate executors working on shared git worktrees"
)]
struct Cli {
    /// Coordination root directory.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `conductor.toml`, `.locks/`, the history dir, and goal subtrees.
    Init {
        /// Overwrite existing config and registry.
        #[arg(short, long)]
        force: bool,
    },
    /// Inspect and manage lock files.
    Locks {
        #[command(subcommand)]
        command: LocksCommand,
    },
}

#[derive(Subcommand)]
enum LocksCommand {
    /// Print every lock with its holder and staleness.
    List,
    /// Remove stale locks and print how many were removed.
    Clean,
    /// Remove a lock unconditionally.
    Release { lock_type: LockType, resource: String },
    /// Acquire a lock on behalf of the calling shell and print its path.
    Acquire {
        lock_type: LockType,
        resource: String,
        #[arg(long)]
        owner: Option<String>,
        /// Wait at most this long; defaults to the lock type's timeout.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Fail immediately if the lock is held.
        #[arg(long, conflicts_with = "timeout_secs")]
        no_wait: bool,
        /// Process recorded as holder; defaults to the parent process.
        #[arg(long)]
        holder_pid: Option<u32>,
    },
}

fn main() -> ExitCode {
    conductor::logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => exit_code(code),
        Err(err) => {
            eprintln!("{err:#}");
            exit_code(exit_codes::INVALID)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => {
            let paths = init_root(&cli.root, &InitOptions { force })?;
            println!("initialized {}", paths.root.display());
            Ok(exit_codes::OK)
        }
        Command::Locks { command } => {
            let (paths, config) = RootPaths::load(&cli.root)?;
            let locks = LockManager::new(&paths.locks_dir, &config.locks);
            run_locks(&locks, command)
        }
    }
}

fn run_locks(locks: &LockManager, command: LocksCommand) -> Result<i32> {
    match command {
        LocksCommand::List => {
            for listed in locks.list_locks()? {
                println!("{}", format_listed(&listed));
            }
            Ok(exit_codes::OK)
        }
        LocksCommand::Clean => {
            let removed = locks.clean_stale_locks()?;
            println!("removed {removed} stale lock(s)");
            Ok(exit_codes::OK)
        }
        LocksCommand::Release {
            lock_type,
            resource,
        } => {
            if locks.force_release(lock_type, &resource)? {
                println!("released {lock_type} {resource}");
            } else {
                println!("no {lock_type} lock on {resource}");
            }
            Ok(exit_codes::OK)
        }
        LocksCommand::Acquire {
            lock_type,
            resource,
            owner,
            timeout_secs,
            no_wait,
            holder_pid,
        } => {
            let request = LockRequest {
                owner,
                pid: Some(holder_pid.unwrap_or_else(default_holder_pid)),
                ..LockRequest::default()
            };
            let result = if no_wait {
                locks.try_acquire(lock_type, &resource, &request)
            } else {
                let timeout = timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| locks.default_timeout(lock_type));
                locks.acquire(lock_type, &resource, timeout, &request)
            };
            match result {
                Ok(lock) => {
                    println!("{}", lock.path.display());
                    Ok(exit_codes::OK)
                }
                Err(err @ LockError::Held { .. }) => {
                    eprintln!("{err}");
                    Ok(exit_codes::LOCK_HELD)
                }
                Err(err @ LockError::Timeout { .. }) => {
                    eprintln!("{err}");
                    Ok(exit_codes::LOCK_TIMEOUT)
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}

#[cfg(unix)]
fn default_holder_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn default_holder_pid() -> u32 {
    std::process::id()
}

fn format_listed(listed: &ListedLock) -> String {
    let stale = match listed.stale {
        Some(reason) => format!(" stale({reason:?})"),
        None => String::new(),
    };
    match &listed.info {
        Some(info) => format!(
            "{}\t{}\t{}@{}\t{}\t{}{}",
            info.lock_type,
            info.resource,
            info.pid,
            info.hostname,
            info.owner.as_deref().unwrap_or("-"),
            info.acquired_at.to_rfc3339(),
            stale
        ),
        None => format!("{}\t(unreadable){}", listed.file_name, stale),
    }
}
