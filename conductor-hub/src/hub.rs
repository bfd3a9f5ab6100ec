//! In-process broker of live executor sessions, pending questions, user
//! messages, and broadcast events.
//!
//! Each collection sits behind its own `RwLock` and is only reachable through
//! `Hub` methods. Locks are never held across an `.await`.
//!
//! Broadcast is best-effort: every subscriber owns a bounded queue and a full
//! queue drops the event for that subscriber only.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use conductor::core::history::{GoalSession, HistoryEntry};
use conductor::io::goal::GoalLookup;
use conductor::io::history::HistoryLog;
use conductor::io::init::EXECUTOR_LOG_FILE;
use conductor::io::process::read_output_tail;
use conductor::io::prompt::{ExecutorPrompt, render_executor_prompt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Queue depth per subscriber before events are dropped for it.
pub const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("question '{0}' is already pending")]
    QuestionExists(String),
    #[error("question '{0}' was withdrawn before it was answered")]
    AnswerDropped(String),
    #[error("no live executor session for goal '{goal_id}'{}", describe_session(.session_id.as_deref()))]
    SessionNotFound {
        goal_id: String,
        session_id: Option<String>,
    },
    #[error("goal '{goal_id}' already has live session '{session_id}'")]
    SessionActive { goal_id: String, session_id: String },
}

fn describe_session(session_id: Option<&str>) -> String {
    session_id
        .map(|id| format!(" with session '{id}'"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    /// Rooted at the goal's own folder; may span projects.
    Meta,
    /// Rooted at the goal's worktree inside one project.
    Project,
}

impl ExecutorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorType::Meta => "meta",
            ExecutorType::Project => "project",
        }
    }
}

/// A live executor, as tracked between spawn and exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorSession {
    pub goal_id: String,
    pub session_id: String,
    pub cwd: PathBuf,
    pub user: String,
    pub executor_type: ExecutorType,
    pub project: Option<String>,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub claude_session_id: Option<String>,
    pub transcript_path: Option<String>,
}

/// External-agent identifiers reported after the process started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub claude_session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question_id: String,
    pub goal_id: String,
    pub session_id: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default = "Utc::now")]
    pub asked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMessage {
    pub id: String,
    pub goal_id: String,
    pub text: String,
    pub user: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Everything subscribers can observe. Serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Question {
        #[serde(flatten)]
        question: Question,
    },
    Answered {
        question_id: String,
        goal_id: String,
        session_id: String,
        answer: String,
    },
    ExecutorStarted {
        #[serde(flatten)]
        session: ExecutorSession,
    },
    ExecutorUpdated {
        goal_id: String,
        session_id: String,
        claude_session_id: Option<String>,
        transcript_path: Option<String>,
    },
    ExecutorStopped {
        goal_id: String,
        session_id: String,
        reason: String,
        output_tail: String,
        claude_session_id: Option<String>,
    },
    UserMessage {
        #[serde(flatten)]
        message: UserMessage,
    },
    Activity {
        goal_id: String,
        session_id: Option<String>,
        kind: String,
        message: String,
    },
    RegistryUpdated {
        path: PathBuf,
    },
    GoalUpdated {
        goal_id: String,
        path: PathBuf,
    },
    GoalIced {
        goal_id: String,
        path: PathBuf,
    },
    GoalCompleted {
        goal_id: String,
        path: PathBuf,
    },
    FileChanged {
        path: PathBuf,
    },
}

impl HubEvent {
    /// SSE event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            HubEvent::Question { .. } => "question",
            HubEvent::Answered { .. } => "answered",
            HubEvent::ExecutorStarted { .. } => "executor_started",
            HubEvent::ExecutorUpdated { .. } => "executor_updated",
            HubEvent::ExecutorStopped { .. } => "executor_stopped",
            HubEvent::UserMessage { .. } => "user_message",
            HubEvent::Activity { .. } => "activity",
            HubEvent::RegistryUpdated { .. } => "registry_updated",
            HubEvent::GoalUpdated { .. } => "goal_updated",
            HubEvent::GoalIced { .. } => "goal_iced",
            HubEvent::GoalCompleted { .. } => "goal_completed",
            HubEvent::FileChanged { .. } => "file_changed",
        }
    }
}

/// Receiving end of a subscription.
///
/// `recv` yields `None` once the hub drops the subscriber (after
/// [`Hub::unsubscribe`]); events queued before that are still delivered.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<HubEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Directory of the per-goal history logs.
    pub history_dir: PathBuf,
    /// Address the hub is listening on; executors call back here.
    pub addr: SocketAddr,
    pub output_tail_bytes: usize,
    pub output_tail_lines: usize,
}

struct PendingQuestion {
    question: Question,
    token: u64,
    answer_tx: oneshot::Sender<String>,
}

pub struct Hub {
    options: HubOptions,
    history: HistoryLog,
    goals: Arc<dyn GoalLookup>,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<HubEvent>>>,
    questions: RwLock<HashMap<String, PendingQuestion>>,
    sessions: RwLock<HashMap<String, ExecutorSession>>,
    messages: RwLock<HashMap<String, Vec<UserMessage>>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new(options: HubOptions, goals: Arc<dyn GoalLookup>) -> Self {
        Self {
            history: HistoryLog::new(&options.history_dir),
            options,
            goals,
            subscribers: RwLock::new(HashMap::new()),
            questions: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn port(&self) -> u16 {
        self.options.addr.port()
    }

    /// Base URL for executor callbacks. A wildcard bind is reached over loopback.
    pub fn callback_url(&self) -> String {
        let ip = match self.options.addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        format!("http://{}", SocketAddr::new(ip, self.port()))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // --- subscribers ---

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id();
        write(&self.subscribers).insert(id, tx);
        debug!(subscriber = id, "subscribed");
        Subscription { id, rx }
    }

    /// Stop delivery to `id` and close its stream.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = write(&self.subscribers).remove(&id).is_some();
        debug!(subscriber = id, removed, "unsubscribed");
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        read(&self.subscribers).len()
    }

    /// Deliver `event` to every subscriber without waiting.
    pub fn broadcast(&self, event: HubEvent) {
        let mut closed = Vec::new();
        {
            let subscribers = read(&self.subscribers);
            for (id, tx) in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subscriber = id, event = event.event_type(), "subscriber full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = write(&self.subscribers);
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    // --- questions ---

    /// Register `question`, broadcast it, and wait for its answer.
    ///
    /// There is no built-in deadline. If the returned future is dropped the
    /// question is withdrawn.
    pub async fn ask(&self, question: Question) -> Result<String, HubError> {
        let (answer_tx, answer_rx) = oneshot::channel();
        let token = self.next_id();
        {
            let mut questions = write(&self.questions);
            if questions.contains_key(&question.question_id) {
                return Err(HubError::QuestionExists(question.question_id));
            }
            questions.insert(
                question.question_id.clone(),
                PendingQuestion {
                    question: question.clone(),
                    token,
                    answer_tx,
                },
            );
        }
        let _withdraw = WithdrawOnDrop {
            hub: self,
            question_id: &question.question_id,
            token,
        };
        info!(question_id = %question.question_id, goal_id = %question.goal_id, "question pending");
        self.broadcast(HubEvent::Question {
            question: question.clone(),
        });

        answer_rx
            .await
            .map_err(|_| HubError::AnswerDropped(question.question_id.clone()))
    }

    /// Deliver `answer` to the asker of `question_id`.
    ///
    /// Returns false, with no side effects, if the question is not pending.
    pub fn answer(&self, question_id: &str, answer: &str) -> bool {
        let Some(pending) = write(&self.questions).remove(question_id) else {
            debug!(question_id, "answer for unknown question");
            return false;
        };
        let question = pending.question;
        if pending.answer_tx.send(answer.to_string()).is_err() {
            warn!(question_id, "asker went away before the answer arrived");
        }

        self.persist(
            &question.goal_id,
            &HistoryEntry::Question {
                timestamp: Utc::now(),
                question_id: question.question_id.clone(),
                session_id: question.session_id.clone(),
                question: question.question.clone(),
                options: question.options.clone(),
                answer: answer.to_string(),
                asked_at: question.asked_at,
            },
        );
        info!(question_id, goal_id = %question.goal_id, "question answered");
        self.broadcast(HubEvent::Answered {
            question_id: question.question_id,
            goal_id: question.goal_id,
            session_id: question.session_id,
            answer: answer.to_string(),
        });
        true
    }

    pub fn pending_questions(&self) -> Vec<Question> {
        let mut questions: Vec<Question> = read(&self.questions)
            .values()
            .map(|p| p.question.clone())
            .collect();
        questions.sort_by(|a, b| {
            a.asked_at
                .cmp(&b.asked_at)
                .then_with(|| a.question_id.cmp(&b.question_id))
        });
        questions
    }

    fn withdraw(&self, question_id: &str, token: u64) {
        let mut questions = write(&self.questions);
        if questions.get(question_id).is_some_and(|p| p.token == token) {
            questions.remove(question_id);
            debug!(question_id, "question withdrawn");
        }
    }

    // --- executor sessions ---

    /// Context prompt for `session`, with caller-supplied `context` appended.
    pub fn executor_context(
        &self,
        session: &ExecutorSession,
        context: Option<&str>,
    ) -> anyhow::Result<String> {
        let goal = self.goals.goal(&session.goal_id);
        let callback_url = self.callback_url();
        render_executor_prompt(&ExecutorPrompt {
            goal_id: &session.goal_id,
            session_id: &session.session_id,
            executor_type: session.executor_type.as_str(),
            mode: &session.mode,
            project: session.project.as_deref(),
            cwd: &session.cwd,
            callback_url: &callback_url,
            goal: goal.as_ref(),
            context,
        })
    }

    /// Record `session` as live, persist its start, and broadcast it.
    ///
    /// Returns the context prompt for the session.
    pub fn register_executor(
        &self,
        session: ExecutorSession,
        context: Option<&str>,
    ) -> Result<String, HubError> {
        {
            let mut sessions = write(&self.sessions);
            if let Some(existing) = sessions.get(&session.goal_id) {
                return Err(HubError::SessionActive {
                    goal_id: session.goal_id.clone(),
                    session_id: existing.session_id.clone(),
                });
            }
            sessions.insert(session.goal_id.clone(), session.clone());
        }

        self.persist(
            &session.goal_id,
            &HistoryEntry::SessionStart {
                timestamp: session.started_at,
                session_id: session.session_id.clone(),
                cwd: session.cwd.display().to_string(),
                user: session.user.clone(),
                executor_type: Some(session.executor_type.as_str().to_string()),
                project: session.project.clone(),
            },
        );
        info!(goal_id = %session.goal_id, session_id = %session.session_id, cwd = %session.cwd.display(), "executor registered");

        let prompt = match self.executor_context(&session, context) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(goal_id = %session.goal_id, err = %err, "failed to render executor context");
                String::new()
            }
        };
        self.broadcast(HubEvent::ExecutorStarted { session });
        Ok(prompt)
    }

    /// Attach external-agent identifiers to the live session of `goal_id`.
    pub fn attach_session_info(
        &self,
        goal_id: &str,
        session_id: Option<&str>,
        info: &SessionInfo,
    ) -> Result<ExecutorSession, HubError> {
        let updated = {
            let mut sessions = write(&self.sessions);
            let session = sessions
                .get_mut(goal_id)
                .filter(|s| session_id.is_none_or(|id| id == s.session_id))
                .ok_or_else(|| HubError::SessionNotFound {
                    goal_id: goal_id.to_string(),
                    session_id: session_id.map(str::to_string),
                })?;
            merge_info(session, info);
            session.clone()
        };
        debug!(goal_id, session_id = %updated.session_id, "session info attached");
        self.broadcast(HubEvent::ExecutorUpdated {
            goal_id: goal_id.to_string(),
            session_id: updated.session_id.clone(),
            claude_session_id: updated.claude_session_id.clone(),
            transcript_path: updated.transcript_path.clone(),
        });
        Ok(updated)
    }

    pub fn stop_executor(
        &self,
        goal_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<ExecutorSession, HubError> {
        self.stop_executor_with_info(goal_id, session_id, reason, &SessionInfo::default())
    }

    /// Move the live session to history with a tail of its captured output.
    pub fn stop_executor_with_info(
        &self,
        goal_id: &str,
        session_id: &str,
        reason: &str,
        info: &SessionInfo,
    ) -> Result<ExecutorSession, HubError> {
        let mut session = {
            let mut sessions = write(&self.sessions);
            match sessions.get(goal_id) {
                Some(s) if s.session_id == session_id => {}
                _ => {
                    return Err(HubError::SessionNotFound {
                        goal_id: goal_id.to_string(),
                        session_id: Some(session_id.to_string()),
                    });
                }
            }
            sessions
                .remove(goal_id)
                .ok_or_else(|| HubError::SessionNotFound {
                    goal_id: goal_id.to_string(),
                    session_id: Some(session_id.to_string()),
                })?
        };
        merge_info(&mut session, info);

        let log_path = session.cwd.join(EXECUTOR_LOG_FILE);
        let output_tail = read_output_tail(
            &log_path,
            self.options.output_tail_bytes,
            self.options.output_tail_lines,
        )
        .unwrap_or_else(|err| {
            warn!(path = %log_path.display(), err = %err, "failed to read executor output");
            String::new()
        });

        self.persist(
            goal_id,
            &HistoryEntry::SessionStop {
                timestamp: Utc::now(),
                session_id: session_id.to_string(),
                reason: reason.to_string(),
                claude_session_id: session.claude_session_id.clone(),
                transcript_path: session.transcript_path.clone(),
                output_tail: (!output_tail.is_empty()).then(|| output_tail.clone()),
            },
        );
        info!(goal_id, session_id, reason, "executor stopped");
        self.broadcast(HubEvent::ExecutorStopped {
            goal_id: goal_id.to_string(),
            session_id: session_id.to_string(),
            reason: reason.to_string(),
            output_tail,
            claude_session_id: session.claude_session_id.clone(),
        });
        Ok(session)
    }

    pub fn active_session(&self, goal_id: &str) -> Option<ExecutorSession> {
        read(&self.sessions).get(goal_id).cloned()
    }

    pub fn active_executors(&self) -> Vec<ExecutorSession> {
        let mut sessions: Vec<_> = read(&self.sessions).values().cloned().collect();
        sessions.sort_by(|a, b| a.goal_id.cmp(&b.goal_id));
        sessions
    }

    // --- user messages ---

    pub fn send_user_message(&self, goal_id: &str, text: &str, user: Option<&str>) -> UserMessage {
        let sent_at = Utc::now();
        let message = UserMessage {
            id: format!("msg-{}-{}", sent_at.timestamp_millis(), self.next_id()),
            goal_id: goal_id.to_string(),
            text: text.to_string(),
            user: user.map(str::to_string),
            sent_at,
        };
        write(&self.messages)
            .entry(goal_id.to_string())
            .or_default()
            .push(message.clone());
        debug!(goal_id, message_id = %message.id, "user message queued");
        self.broadcast(HubEvent::UserMessage {
            message: message.clone(),
        });
        message
    }

    /// Take every queued message for `goal_id`.
    pub fn get_pending_user_messages(&self, goal_id: &str) -> Vec<UserMessage> {
        write(&self.messages).remove(goal_id).unwrap_or_default()
    }

    pub fn has_pending_user_messages(&self, goal_id: &str) -> bool {
        read(&self.messages)
            .get(goal_id)
            .is_some_and(|queue| !queue.is_empty())
    }

    // --- history ---

    pub fn record_activity(&self, goal_id: &str, session_id: Option<&str>, kind: &str, message: &str) {
        self.persist(
            goal_id,
            &HistoryEntry::Activity {
                timestamp: Utc::now(),
                session_id: session_id.map(str::to_string),
                kind: kind.to_string(),
                message: message.to_string(),
            },
        );
        self.broadcast(HubEvent::Activity {
            goal_id: goal_id.to_string(),
            session_id: session_id.map(str::to_string),
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }

    pub fn goal_sessions(&self, goal_id: &str) -> anyhow::Result<Vec<GoalSession>> {
        self.history.goal_sessions(goal_id)
    }

    pub fn goal_history(&self, goal_id: &str) -> anyhow::Result<Vec<HistoryEntry>> {
        self.history.goal_history(goal_id)
    }

    pub fn session_history(
        &self,
        goal_id: &str,
        session_id: &str,
    ) -> anyhow::Result<Vec<HistoryEntry>> {
        self.history.session_history(goal_id, session_id)
    }

    /// History writes never fail the operation that triggered them.
    fn persist(&self, goal_id: &str, entry: &HistoryEntry) {
        if let Err(err) = self.history.append(goal_id, entry) {
            warn!(goal_id, err = %err, "failed to write history record");
        }
    }
}

struct WithdrawOnDrop<'a> {
    hub: &'a Hub,
    question_id: &'a str,
    token: u64,
}

impl Drop for WithdrawOnDrop<'_> {
    fn drop(&mut self) {
        self.hub.withdraw(self.question_id, self.token);
    }
}

fn merge_info(session: &mut ExecutorSession, info: &SessionInfo) {
    if let Some(id) = &info.claude_session_id {
        session.claude_session_id = Some(id.clone());
    }
    if let Some(path) = &info.transcript_path {
        session.transcript_path = Some(path.clone());
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor::io::goal::GoalDetail;
    use std::time::Duration;

    struct NoGoals;

    impl GoalLookup for NoGoals {
        fn goal(&self, _id: &str) -> Option<GoalDetail> {
            None
        }
    }

    fn hub(dir: &std::path::Path) -> Arc<Hub> {
        Arc::new(Hub::new(
            HubOptions {
                history_dir: dir.join(".history"),
                addr: SocketAddr::from(([127, 0, 0, 1], 7777)),
                output_tail_bytes: 4000,
                output_tail_lines: 40,
            },
            Arc::new(NoGoals),
        ))
    }

    fn question(id: &str) -> Question {
        Question {
            question_id: id.to_string(),
            goal_id: "g1".to_string(),
            session_id: "s1".to_string(),
            question: format!("{id}?"),
            options: vec!["yes".to_string(), "no".to_string()],
            asked_at: Utc::now(),
        }
    }

    fn session(goal_id: &str, session_id: &str, cwd: PathBuf) -> ExecutorSession {
        ExecutorSession {
            goal_id: goal_id.to_string(),
            session_id: session_id.to_string(),
            cwd,
            user: "alice".to_string(),
            executor_type: ExecutorType::Project,
            project: Some("P".to_string()),
            mode: "autonomous".to_string(),
            started_at: Utc::now(),
            claude_session_id: None,
            transcript_path: None,
        }
    }

    async fn wait_for_pending(hub: &Hub, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.pending_questions().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("questions become pending");
    }

    #[test]
    fn callback_url_follows_the_bound_address() {
        let temp = tempfile::tempdir().expect("tempdir");
        let url_for = |addr: &str| {
            Hub::new(
                HubOptions {
                    history_dir: temp.path().join(".history"),
                    addr: addr.parse().expect("addr"),
                    output_tail_bytes: 4000,
                    output_tail_lines: 40,
                },
                Arc::new(NoGoals),
            )
            .callback_url()
        };

        assert_eq!(url_for("10.1.2.3:3001"), "http://10.1.2.3:3001");
        assert_eq!(url_for("0.0.0.0:3001"), "http://127.0.0.1:3001");
        assert_eq!(url_for("[::]:3001"), "http://[::1]:3001");
        assert_eq!(hub(temp.path()).port(), 7777);
    }

    #[tokio::test]
    async fn answer_is_delivered_exactly_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hub = hub(temp.path());
        let mut sub = hub.subscribe();

        let asker = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.ask(question("q1")).await })
        };
        wait_for_pending(&hub, 1).await;

        assert!(hub.answer("q1", "yes"));
        assert!(!hub.answer("q1", "no"));
        let answer = tokio::time::timeout(Duration::from_secs(5), asker)
            .await
            .expect("asker finishes")
            .expect("join")
            .expect("answer");
        assert_eq!(answer, "yes");
        assert!(hub.pending_questions().is_empty());

        assert_eq!(sub.recv().await.map(|e| e.event_type()), Some("question"));
        assert_eq!(sub.recv().await.map(|e| e.event_type()), Some("answered"));
        assert!(sub.try_recv().is_none());

        let history = hub.goal_history("g1").expect("history");
        assert!(matches!(&history[0], HistoryEntry::Question { answer, .. } if answer == "yes"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_questions_get_their_own_answers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hub = hub(temp.path());

        let askers: Vec<_> = (0..5)
            .map(|i| {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move { (i, hub.ask(question(&format!("q{i}"))).await) })
            })
            .collect();
        wait_for_pending(&hub, 5).await;

        for i in (0..5).rev() {
            assert!(hub.answer(&format!("q{i}"), &format!("answer-{i}")));
        }
        for asker in askers {
            let (i, answer) = tokio::time::timeout(Duration::from_secs(5), asker)
                .await
                .expect("asker finishes")
                .expect("join");
            assert_eq!(answer.expect("answer"), format!("answer-{i}"));
        }
    }

    #[tokio::test]
    async fn duplicate_pending_question_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hub = hub(temp.path());
        let first = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.ask(question("dup")).await })
        };
        wait_for_pending(&hub, 1).await;

        let err = hub.ask(question("dup")).await.unwrap_err();
        assert!(matches!(err, HubError::QuestionExists(id) if id == "dup"));
        assert!(hub.answer("dup", "ok"));
        assert_eq!(first.await.expect("join").expect("answer"), "ok");
    }

    #[tokio::test]
    async fn dropped_asker_withdraws_question() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hub = hub(temp.path());
        let asked = tokio::time::timeout(Duration::from_millis(50), hub.ask(question("q1"))).await;
        assert!(asked.is_err());
        assert!(hub.pending_questions().is_empty());
        assert!(!hub.answer("q1", "late"));
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking_others() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hub = hub(temp.path());
        let mut slow = hub.subscribe_with_capacity(1);
        let mut fast = hub.subscribe();

        for i in 0..3 {
            hub.send_user_message("g1", &format!("m{i}"), None);
        }

        let mut fast_count = 0;
        while fast.try_recv().is_some() {
            fast_count += 1;
        }
        assert_eq!(fast_count, 3);

        let first = slow.try_recv().expect("first event kept");
        assert!(matches!(first, HubEvent::UserMessage { message } if message.text == "m0"));
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_closes_stream_after_queued_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hub = hub(temp.path());
        let mut sub = hub.subscribe();
        hub.send_user_message("g1", "before", None);

        assert!(hub.unsubscribe(sub.id()));
        hub.send_user_message("g1", "after", None);

        assert!(matches!(sub.recv().await, Some(HubEvent::UserMessage { .. })));
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned_on_broadcast() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hub = hub(temp.path());
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 1);
        hub.send_user_message("g1", "x", None);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn session_lifecycle_moves_to_history_with_output_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hub = hub(temp.path());
        let cwd = temp.path().join("goal-g1-x");
        std::fs::create_dir(&cwd).expect("mkdir");
        std::fs::write(cwd.join(EXECUTOR_LOG_FILE), "working\ndone\n").expect("log");
        let mut sub = hub.subscribe();

        let prompt = hub
            .register_executor(session("g1", "s1", cwd.clone()), Some("go"))
            .expect("register");
        assert!(prompt.contains("`g1`"));
        let err = hub
            .register_executor(session("g1", "s2", cwd.clone()), None)
            .unwrap_err();
        assert!(matches!(err, HubError::SessionActive { ref session_id, .. } if session_id == "s1"));

        hub.attach_session_info(
            "g1",
            Some("s1"),
            &SessionInfo {
                claude_session_id: Some("c-1".to_string()),
                transcript_path: None,
            },
        )
        .expect("attach");
        assert!(hub.stop_executor("g1", "other", "completed").is_err());

        let stopped = hub
            .stop_executor_with_info(
                "g1",
                "s1",
                "completed",
                &SessionInfo {
                    claude_session_id: None,
                    transcript_path: Some("/t.jsonl".to_string()),
                },
            )
            .expect("stop");
        assert_eq!(stopped.claude_session_id.as_deref(), Some("c-1"));
        assert!(hub.active_executors().is_empty());

        let types: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.event_type())
            .collect();
        assert_eq!(types, ["executor_started", "executor_updated", "executor_stopped"]);

        let sessions = hub.goal_sessions("g1").expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].stop_reason.as_deref(), Some("completed"));
        assert_eq!(sessions[0].transcript_path.as_deref(), Some("/t.jsonl"));
        let history = hub.session_history("g1", "s1").expect("history");
        assert!(matches!(&history[1], HistoryEntry::SessionStop { output_tail: Some(tail), .. } if tail == "working\ndone"));
    }

    #[tokio::test]
    async fn user_messages_are_consumed_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hub = hub(temp.path());
        assert!(!hub.has_pending_user_messages("g1"));
        hub.send_user_message("g1", "stop after tests", Some("alice"));
        hub.send_user_message("g1", "then merge", None);
        assert!(hub.has_pending_user_messages("g1"));
        assert!(!hub.has_pending_user_messages("g2"));

        let messages = hub.get_pending_user_messages("g1");
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["stop after tests", "then merge"]);
        assert!(hub.get_pending_user_messages("g1").is_empty());
        assert!(!hub.has_pending_user_messages("g1"));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = HubEvent::GoalIced {
            goal_id: "g1".to_string(),
            path: PathBuf::from("/r/goals/iced/g1.md"),
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "goal_iced");
        assert_eq!(json["goal_id"], "g1");
        assert_eq!(event.event_type(), "goal_iced");
    }
}
