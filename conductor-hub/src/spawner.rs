//! Executor spawn and lifecycle tracking.
//!
//! At most one executor is live per goal. Spawns for the same goal are
//! serialized through a per-goal async mutex, and the hub's live-session set
//! is checked inside it. A session is registered only after the child
//! process has started, and before `spawn` returns.
//!
//! Exit is detected solely by a background waiter task per child.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use conductor::core::session::new_session_id;
use conductor::io::goal::validate_id;
use conductor::io::init::{EXECUTOR_LOG_FILE, RootPaths};
use conductor::io::project::ProjectLookup;
use conductor::io::worktree::{WorktreeLookupError, resolve_goal_worktree};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::hub::{ExecutorSession, ExecutorType, Hub, HubError};

pub const DEFAULT_MODE: &str = "autonomous";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("choose either a meta executor or a project executor, not both")]
    ConflictingMode,
    #[error("a project executor needs a project name (or request a meta executor)")]
    MissingMode,
    #[error("invalid goal id: {0}")]
    InvalidGoalId(String),
    #[error("goal '{goal_id}' already has a running executor (session {session_id})")]
    AlreadyRunning { goal_id: String, session_id: String },
    #[error("unknown project '{0}'")]
    ProjectNotFound(String),
    #[error("workspace {} does not exist", .0.display())]
    WorkspaceNotFound(PathBuf),
    #[error("no worktree matching '{pattern}' under {}", .dir.display())]
    WorktreeNotFound { dir: PathBuf, pattern: String },
    #[error("several worktrees match under {}: {}", .dir.display(), .matches.join(", "))]
    AmbiguousWorktree { dir: PathBuf, matches: Vec<String> },
    #[error("create executor log {}: {source}", .path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("start executor `{command}`: {source}")]
    ProcessStart {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl From<WorktreeLookupError> for SpawnError {
    fn from(err: WorktreeLookupError) -> Self {
        match err {
            WorktreeLookupError::WorkspaceMissing(dir) => SpawnError::WorkspaceNotFound(dir),
            WorktreeLookupError::NotFound { dir, pattern } => {
                SpawnError::WorktreeNotFound { dir, pattern }
            }
            WorktreeLookupError::Ambiguous { dir, matches, .. } => {
                SpawnError::AmbiguousWorktree { dir, matches }
            }
            WorktreeLookupError::Io(err) => SpawnError::Io(err),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpawnRequest {
    pub goal_id: String,
    /// Extra instructions appended to the executor prompt.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    /// Execution mode passed through to the child; defaults to `autonomous`.
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnResult {
    pub goal_id: String,
    pub session_id: String,
    pub cwd: PathBuf,
    pub executor_type: ExecutorType,
    pub pid: Option<u32>,
    pub log_path: PathBuf,
}

struct KillHandle {
    session_id: String,
    kill_tx: oneshot::Sender<()>,
}

pub struct Spawner {
    hub: Arc<Hub>,
    projects: Arc<dyn ProjectLookup>,
    paths: RootPaths,
    command: Vec<String>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    kills: Arc<Mutex<HashMap<String, KillHandle>>>,
}

impl Spawner {
    pub fn new(
        hub: Arc<Hub>,
        projects: Arc<dyn ProjectLookup>,
        paths: RootPaths,
        command: Vec<String>,
    ) -> Self {
        Self {
            hub,
            projects,
            paths,
            command,
            gates: Mutex::new(HashMap::new()),
            kills: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start an executor for `request.goal_id` and register it with the hub.
    #[instrument(skip_all, fields(goal_id = %request.goal_id, meta = request.meta, project = ?request.project))]
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResult, SpawnError> {
        let executor_type = match (request.meta, request.project.as_deref()) {
            (true, Some(_)) => return Err(SpawnError::ConflictingMode),
            (true, None) => ExecutorType::Meta,
            (false, Some(_)) => ExecutorType::Project,
            (false, None) => return Err(SpawnError::MissingMode),
        };
        validate_id(&request.goal_id)
            .map_err(|err| SpawnError::InvalidGoalId(err.to_string()))?;

        let gate = self.gate(&request.goal_id);
        let _guard = gate.lock().await;

        if let Some(existing) = self.hub.active_session(&request.goal_id) {
            warn!(session_id = %existing.session_id, "executor already running");
            return Err(SpawnError::AlreadyRunning {
                goal_id: request.goal_id,
                session_id: existing.session_id,
            });
        }

        let cwd = match executor_type {
            ExecutorType::Project => {
                let name = request.project.clone().unwrap_or_default();
                let project = self
                    .projects
                    .project(&name)
                    .ok_or(SpawnError::ProjectNotFound(name))?;
                resolve_goal_worktree(&project.workspace, &request.goal_id)?
            }
            ExecutorType::Meta => meta_folder(&self.paths, &request.goal_id)?,
        };

        let session = ExecutorSession {
            goal_id: request.goal_id.clone(),
            session_id: new_session_id(),
            cwd: cwd.clone(),
            user: request.user.clone().unwrap_or_else(default_user),
            executor_type,
            project: request.project.clone(),
            mode: request.mode.clone().unwrap_or_else(|| DEFAULT_MODE.to_string()),
            started_at: Utc::now(),
            claude_session_id: None,
            transcript_path: None,
        };
        let prompt = self
            .hub
            .executor_context(&session, request.context.as_deref())?;

        let log_path = cwd.join(EXECUTOR_LOG_FILE);
        let child = self.start_child(&session, &prompt, &log_path)?;
        let pid = child.id();

        if let Err(err) = self
            .hub
            .register_executor(session.clone(), request.context.as_deref())
        {
            // Only possible if something registered the goal outside this spawner.
            warn!(err = %err, "registration rejected, killing fresh executor");
            kill_orphan(child).await;
            return Err(match err {
                HubError::SessionActive {
                    goal_id,
                    session_id,
                } => SpawnError::AlreadyRunning {
                    goal_id,
                    session_id,
                },
                other => SpawnError::Io(other.into()),
            });
        }

        self.watch_child(child, &session);
        info!(session_id = %session.session_id, pid = ?pid, cwd = %cwd.display(), "executor spawned");

        Ok(SpawnResult {
            goal_id: session.goal_id,
            session_id: session.session_id,
            cwd,
            executor_type,
            pid,
            log_path,
        })
    }

    /// Ask the live executor of `goal_id` to stop.
    ///
    /// The waiter kills the child and reports the stop with reason
    /// `stopped`. Returns the session id that was signalled.
    pub fn terminate(&self, goal_id: &str) -> Result<String, HubError> {
        let handle = lock(&self.kills).remove(goal_id);
        match handle {
            Some(handle) => {
                if handle.kill_tx.send(()).is_err() {
                    debug!(goal_id, "executor already exiting");
                }
                info!(goal_id, session_id = %handle.session_id, "executor termination requested");
                Ok(handle.session_id)
            }
            None => match self.hub.active_session(goal_id) {
                // Live in the hub without a waiter here: report the stop directly.
                Some(session) => {
                    self.hub
                        .stop_executor(goal_id, &session.session_id, "stopped")?;
                    Ok(session.session_id)
                }
                None => Err(HubError::SessionNotFound {
                    goal_id: goal_id.to_string(),
                    session_id: None,
                }),
            },
        }
    }

    fn gate(&self, goal_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = lock(&self.gates);
        Arc::clone(gates.entry(goal_id.to_string()).or_default())
    }

    fn start_child(
        &self,
        session: &ExecutorSession,
        prompt: &str,
        log_path: &Path,
    ) -> Result<Child, SpawnError> {
        let log_error = |source| SpawnError::LogFile {
            path: log_path.to_path_buf(),
            source,
        };
        let stdout = File::create(log_path).map_err(log_error)?;
        let stderr = stdout.try_clone().map_err(log_error)?;

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| SpawnError::Io(anyhow::anyhow!("executor command is empty")))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(prompt)
            .current_dir(&session.cwd)
            .env("CONDUCTOR_PORT", self.hub.port().to_string())
            .env("CONDUCTOR_URL", self.hub.callback_url())
            .env("CONDUCTOR_EXECUTOR_TYPE", session.executor_type.as_str())
            .env("CONDUCTOR_GOAL_ID", &session.goal_id)
            .env("CONDUCTOR_SESSION_ID", &session.session_id)
            .env("CONDUCTOR_MODE", &session.mode)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(project) = &session.project {
            cmd.env("CONDUCTOR_PROJECT", project);
        }

        cmd.spawn().map_err(|source| SpawnError::ProcessStart {
            command: self.command.join(" "),
            source,
        })
    }

    fn watch_child(&self, mut child: Child, session: &ExecutorSession) {
        let (kill_tx, mut kill_rx) = oneshot::channel();
        lock(&self.kills).insert(
            session.goal_id.clone(),
            KillHandle {
                session_id: session.session_id.clone(),
                kill_tx,
            },
        );

        let hub = Arc::clone(&self.hub);
        let kills = Arc::clone(&self.kills);
        let goal_id = session.goal_id.clone();
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => debug!(goal_id = %goal_id, code = ?status.code(), "executor exited"),
                        Err(err) => warn!(goal_id = %goal_id, err = %err, "failed to wait for executor"),
                    }
                    "completed"
                }
                Ok(()) = &mut kill_rx => {
                    if let Err(err) = child.kill().await {
                        warn!(goal_id = %goal_id, err = %err, "failed to kill executor");
                    }
                    "stopped"
                }
            };

            {
                let mut kills = lock(&kills);
                if kills.get(&goal_id).is_some_and(|h| h.session_id == session_id) {
                    kills.remove(&goal_id);
                }
            }
            if let Err(err) = hub.stop_executor(&goal_id, &session_id, reason) {
                debug!(goal_id = %goal_id, err = %err, "session already stopped");
            }
        });
    }
}

/// `goals/{active,iced}/<id>/` if present, else a new `goals/active/<id>/`.
fn meta_folder(paths: &RootPaths, goal_id: &str) -> Result<PathBuf, SpawnError> {
    for dir in [&paths.active_dir, &paths.iced_dir] {
        let candidate = dir.join(goal_id);
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }
    let folder = paths.active_dir.join(goal_id);
    fs::create_dir_all(&folder).map_err(|err| {
        SpawnError::Io(anyhow::Error::new(err).context(format!("create {}", folder.display())))
    })?;
    debug!(folder = %folder.display(), "created meta folder");
    Ok(folder)
}

async fn kill_orphan(mut child: Child) {
    if let Err(err) = child.kill().await {
        warn!(err = %err, "failed to kill unregistered executor");
    }
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
