//! Shared application state for the hub server.

use std::net::SocketAddr;
use std::sync::Arc;

use conductor::io::config::ConductorConfig;
use conductor::io::goal::FsGoals;
use conductor::io::init::RootPaths;
use conductor::io::lock::LockManager;
use conductor::io::project::{ConfigProjects, ProjectLookup};
use conductor::io::worktree::WorktreeOps;

use crate::hub::{Hub, HubOptions};
use crate::spawner::Spawner;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub spawner: Arc<Spawner>,
    pub locks: LockManager,
    pub worktrees: WorktreeOps,
    pub projects: Arc<dyn ProjectLookup>,
    pub paths: RootPaths,
}

impl AppState {
    /// Wire up the hub, spawner, and lock-guarded worktree operations for `paths`.
    ///
    /// `addr` is the bound listener address handed to executors for callbacks.
    pub fn new(paths: RootPaths, config: &ConductorConfig, addr: SocketAddr) -> Self {
        let hub = Arc::new(Hub::new(
            HubOptions {
                history_dir: paths.history_dir.clone(),
                addr,
                output_tail_bytes: config.executor.output_tail_bytes,
                output_tail_lines: config.executor.output_tail_lines,
            },
            Arc::new(FsGoals::new(&paths)),
        ));
        let projects: Arc<dyn ProjectLookup> = Arc::new(ConfigProjects::new(&paths.root, config));
        let spawner = Arc::new(Spawner::new(
            Arc::clone(&hub),
            Arc::clone(&projects),
            paths.clone(),
            config.executor.command.clone(),
        ));
        let locks = LockManager::new(&paths.locks_dir, &config.locks);
        Self {
            hub,
            spawner,
            worktrees: WorktreeOps::new(locks.clone()),
            locks,
            projects,
            paths,
        }
    }
}
