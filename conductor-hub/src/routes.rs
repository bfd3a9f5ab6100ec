//! HTTP API: the executor callback channel and operator endpoints.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use conductor::core::history::{GoalSession, HistoryEntry};
use conductor::core::lock::LockType;
use conductor::io::lock::{ListedLock, LockError};
use conductor::io::project::ProjectInfo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use crate::hub::{ExecutorSession, HubError, Question, SessionInfo, UserMessage};
use crate::spawner::{SpawnError, SpawnRequest, SpawnResult};
use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ask", post(ask))
        .route("/questions", get(list_questions))
        .route("/questions/{question_id}/answer", post(answer_question))
        .route("/executors", post(spawn_executor).get(list_executors))
        .route("/executors/{goal_id}/stop", post(stop_executor))
        .route("/executors/{goal_id}/session-info", post(session_info))
        .route(
            "/goals/{goal_id}/messages",
            post(send_message).get(take_messages),
        )
        .route("/goals/{goal_id}/messages/pending", get(has_messages))
        .route("/goals/{goal_id}/sessions", get(goal_sessions))
        .route("/goals/{goal_id}/history", get(goal_history))
        .route(
            "/goals/{goal_id}/sessions/{session_id}/history",
            get(session_history),
        )
        .route("/goals/{goal_id}/activity", post(record_activity))
        .route("/locks", get(list_locks))
        .route("/locks/clean", post(clean_locks))
        .route("/locks/{lock_type}/{resource}", delete(release_lock))
        .route("/projects/{project}/worktrees", post(create_worktree))
        .route("/projects/{project}/pull", post(pull_base))
        .route("/projects/{project}/merge", post(merge_branch))
}

/// Error body `{"error": "..."}` with a status chosen by failure class.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        let status = match &err {
            HubError::QuestionExists(_) | HubError::SessionActive { .. } => StatusCode::CONFLICT,
            HubError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            HubError::AnswerDropped(_) => StatusCode::GONE,
        };
        Self::new(status, err.to_string())
    }
}

impl From<SpawnError> for ApiError {
    fn from(err: SpawnError) -> Self {
        let status = match &err {
            SpawnError::ConflictingMode | SpawnError::MissingMode | SpawnError::InvalidGoalId(_) => {
                StatusCode::BAD_REQUEST
            }
            SpawnError::AlreadyRunning { .. } | SpawnError::AmbiguousWorktree { .. } => {
                StatusCode::CONFLICT
            }
            SpawnError::ProjectNotFound(_)
            | SpawnError::WorkspaceNotFound(_)
            | SpawnError::WorktreeNotFound { .. } => StatusCode::NOT_FOUND,
            SpawnError::LogFile { .. } | SpawnError::ProcessStart { .. } | SpawnError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<LockError> for ApiError {
    fn from(err: LockError) -> Self {
        let status = match &err {
            LockError::Held { .. } | LockError::Timeout { .. } | LockError::Contended { .. } => {
                StatusCode::CONFLICT
            }
            LockError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(lock_err) = err.downcast_ref::<LockError>() {
            let status = match lock_err {
                LockError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::CONFLICT,
            };
            return Self::new(status, format!("{err:#}"));
        }
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct AnswerBody {
    answer: String,
}

/// POST /api/ask - blocks until an operator answers.
async fn ask(State(state): State<AppState>, Json(question): Json<Question>) -> ApiResult<AnswerBody> {
    let answer = state.hub.ask(question).await?;
    Ok(Json(AnswerBody { answer }))
}

async fn list_questions(State(state): State<AppState>) -> Json<Vec<Question>> {
    Json(state.hub.pending_questions())
}

#[derive(Deserialize)]
struct AnswerRequest {
    answer: String,
}

/// POST /api/questions/{question_id}/answer - 404 unless pending.
async fn answer_question(
    State(state): State<AppState>,
    Path(question_id): Path<String>,
    Json(body): Json<AnswerRequest>,
) -> Result<StatusCode, ApiError> {
    if state.hub.answer(&question_id, &body.answer) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("question '{question_id}' is not pending"),
        ))
    }
}

async fn spawn_executor(
    State(state): State<AppState>,
    Json(request): Json<SpawnRequest>,
) -> Result<(StatusCode, Json<SpawnResult>), ApiError> {
    let result = state.spawner.spawn(request).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn list_executors(State(state): State<AppState>) -> Json<Vec<ExecutorSession>> {
    Json(state.hub.active_executors())
}

#[derive(Serialize)]
struct StopResponse {
    session_id: String,
}

/// POST /api/executors/{goal_id}/stop - optional body attaches identifiers first.
async fn stop_executor(
    State(state): State<AppState>,
    Path(goal_id): Path<String>,
    body: Option<Json<SessionInfo>>,
) -> ApiResult<StopResponse> {
    if let Some(Json(info)) = body
        && (info.claude_session_id.is_some() || info.transcript_path.is_some())
    {
        state.hub.attach_session_info(&goal_id, None, &info)?;
    }
    let session_id = state.spawner.terminate(&goal_id)?;
    Ok(Json(StopResponse { session_id }))
}

#[derive(Deserialize)]
struct SessionInfoRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(flatten)]
    info: SessionInfo,
}

async fn session_info(
    State(state): State<AppState>,
    Path(goal_id): Path<String>,
    Json(body): Json<SessionInfoRequest>,
) -> ApiResult<ExecutorSession> {
    let session = state
        .hub
        .attach_session_info(&goal_id, body.session_id.as_deref(), &body.info)?;
    Ok(Json(session))
}

#[derive(Deserialize)]
struct MessageRequest {
    text: String,
    #[serde(default)]
    user: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Path(goal_id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> (StatusCode, Json<UserMessage>) {
    let message = state
        .hub
        .send_user_message(&goal_id, &body.text, body.user.as_deref());
    (StatusCode::CREATED, Json(message))
}

/// GET /api/goals/{goal_id}/messages - consumes the queue.
async fn take_messages(
    State(state): State<AppState>,
    Path(goal_id): Path<String>,
) -> Json<Vec<UserMessage>> {
    Json(state.hub.get_pending_user_messages(&goal_id))
}

#[derive(Serialize)]
struct PendingResponse {
    pending: bool,
}

async fn has_messages(
    State(state): State<AppState>,
    Path(goal_id): Path<String>,
) -> Json<PendingResponse> {
    Json(PendingResponse {
        pending: state.hub.has_pending_user_messages(&goal_id),
    })
}

async fn goal_sessions(
    State(state): State<AppState>,
    Path(goal_id): Path<String>,
) -> ApiResult<Vec<GoalSession>> {
    Ok(Json(state.hub.goal_sessions(&goal_id)?))
}

async fn goal_history(
    State(state): State<AppState>,
    Path(goal_id): Path<String>,
) -> ApiResult<Vec<HistoryEntry>> {
    Ok(Json(state.hub.goal_history(&goal_id)?))
}

async fn session_history(
    State(state): State<AppState>,
    Path((goal_id, session_id)): Path<(String, String)>,
) -> ApiResult<Vec<HistoryEntry>> {
    Ok(Json(state.hub.session_history(&goal_id, &session_id)?))
}

#[derive(Deserialize)]
struct ActivityRequest {
    #[serde(default)]
    session_id: Option<String>,
    kind: String,
    message: String,
}

async fn record_activity(
    State(state): State<AppState>,
    Path(goal_id): Path<String>,
    Json(body): Json<ActivityRequest>,
) -> StatusCode {
    state
        .hub
        .record_activity(&goal_id, body.session_id.as_deref(), &body.kind, &body.message);
    StatusCode::NO_CONTENT
}

async fn list_locks(State(state): State<AppState>) -> ApiResult<Vec<ListedLock>> {
    Ok(Json(state.locks.list_locks()?))
}

#[derive(Serialize)]
struct CleanResponse {
    removed: usize,
}

async fn clean_locks(State(state): State<AppState>) -> ApiResult<CleanResponse> {
    let removed = state.locks.clean_stale_locks()?;
    Ok(Json(CleanResponse { removed }))
}

#[derive(Serialize)]
struct ReleaseResponse {
    released: bool,
}

/// DELETE /api/locks/{lock_type}/{resource} - force release.
async fn release_lock(
    State(state): State<AppState>,
    Path((lock_type, resource)): Path<(String, String)>,
) -> ApiResult<ReleaseResponse> {
    let lock_type: LockType = lock_type
        .parse()
        .map_err(|err: anyhow::Error| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
    let released = state.locks.force_release(lock_type, &resource)?;
    if released {
        warn!(lock_type = %lock_type, resource = %resource, "lock force-released over HTTP");
    }
    Ok(Json(ReleaseResponse { released }))
}

#[derive(Deserialize)]
struct WorktreeRequest {
    goal_id: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Serialize)]
struct WorktreeResponse {
    path: std::path::PathBuf,
}

/// POST /api/projects/{project}/worktrees - runs git under the project locks.
async fn create_worktree(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(body): Json<WorktreeRequest>,
) -> Result<(StatusCode, Json<WorktreeResponse>), ApiError> {
    conductor::io::goal::validate_id(&body.goal_id)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
    let info = project_info(&state, &project)?;
    let owner = body.owner.unwrap_or_else(|| DEFAULT_OWNER.to_string());
    let worktrees = state.worktrees.clone();

    let path = blocking(move || {
        worktrees.create_goal_worktree(&info, &body.goal_id, &body.slug, &owner)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(WorktreeResponse { path })))
}

#[derive(Deserialize)]
struct PullRequest {
    #[serde(default)]
    owner: Option<String>,
}

/// POST /api/projects/{project}/pull - fast-forward the base checkout.
async fn pull_base(
    State(state): State<AppState>,
    Path(project): Path<String>,
    body: Option<Json<PullRequest>>,
) -> Result<StatusCode, ApiError> {
    let info = project_info(&state, &project)?;
    let owner = body
        .and_then(|Json(body)| body.owner)
        .unwrap_or_else(|| DEFAULT_OWNER.to_string());
    let worktrees = state.worktrees.clone();
    blocking(move || worktrees.pull_base(&info, &owner)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct MergeRequest {
    branch: String,
    #[serde(default)]
    owner: Option<String>,
}

/// POST /api/projects/{project}/merge - merge a goal branch into the base branch.
async fn merge_branch(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(body): Json<MergeRequest>,
) -> Result<StatusCode, ApiError> {
    let info = project_info(&state, &project)?;
    let owner = body.owner.unwrap_or_else(|| DEFAULT_OWNER.to_string());
    let worktrees = state.worktrees.clone();
    blocking(move || worktrees.merge_goal_branch(&info, &body.branch, &owner)).await?;
    Ok(StatusCode::NO_CONTENT)
}

const DEFAULT_OWNER: &str = "conductor-hub";

fn project_info(state: &AppState, project: &str) -> Result<ProjectInfo, ApiError> {
    state.projects.project(project).ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, format!("unknown project '{project}'"))
    })
}

/// Git and lock waits block; keep them off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map_err(ApiError::from)
}
