//! Record types for the per-goal history log and the views derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of `goal-<id>.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    SessionStart {
        timestamp: DateTime<Utc>,
        session_id: String,
        cwd: String,
        user: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        executor_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
    },
    SessionStop {
        timestamp: DateTime<Utc>,
        session_id: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        claude_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_tail: Option<String>,
    },
    Question {
        timestamp: DateTime<Utc>,
        question_id: String,
        session_id: String,
        question: String,
        #[serde(default)]
        options: Vec<String>,
        answer: String,
        asked_at: DateTime<Utc>,
    },
    Activity {
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        kind: String,
        message: String,
    },
}

impl HistoryEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HistoryEntry::SessionStart { timestamp, .. }
            | HistoryEntry::SessionStop { timestamp, .. }
            | HistoryEntry::Question { timestamp, .. }
            | HistoryEntry::Activity { timestamp, .. } => *timestamp,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            HistoryEntry::SessionStart { session_id, .. }
            | HistoryEntry::SessionStop { session_id, .. }
            | HistoryEntry::Question { session_id, .. } => Some(session_id),
            HistoryEntry::Activity { session_id, .. } => session_id.as_deref(),
        }
    }
}

/// A session as reconstructed from its start and stop records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalSession {
    pub session_id: String,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub claude_session_id: Option<String>,
    pub transcript_path: Option<String>,
}

impl GoalSession {
    fn empty(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            cwd: None,
            user: None,
            started_at: None,
            stopped_at: None,
            stop_reason: None,
            claude_session_id: None,
            transcript_path: None,
        }
    }
}

/// Fold start/stop records into one summary per session, in first-seen order.
pub fn sessions_from_entries(entries: &[HistoryEntry]) -> Vec<GoalSession> {
    let mut sessions: Vec<GoalSession> = Vec::new();

    for entry in entries {
        match entry {
            HistoryEntry::SessionStart {
                timestamp,
                session_id,
                cwd,
                user,
                ..
            } => {
                let session = find_or_insert(&mut sessions, session_id);
                session.started_at = Some(*timestamp);
                session.cwd = Some(cwd.clone());
                session.user = Some(user.clone());
            }
            HistoryEntry::SessionStop {
                timestamp,
                session_id,
                reason,
                claude_session_id,
                transcript_path,
                ..
            } => {
                let session = find_or_insert(&mut sessions, session_id);
                session.stopped_at = Some(*timestamp);
                session.stop_reason = Some(reason.clone());
                if claude_session_id.is_some() {
                    session.claude_session_id = claude_session_id.clone();
                }
                if transcript_path.is_some() {
                    session.transcript_path = transcript_path.clone();
                }
            }
            HistoryEntry::Question { .. } | HistoryEntry::Activity { .. } => {}
        }
    }

    sessions
}

fn find_or_insert<'a>(sessions: &'a mut Vec<GoalSession>, session_id: &str) -> &'a mut GoalSession {
    let idx = match sessions.iter().position(|s| s.session_id == session_id) {
        Some(idx) => idx,
        None => {
            sessions.push(GoalSession::empty(session_id));
            sessions.len() - 1
        }
    };
    &mut sessions[idx]
}

/// Entries belonging to one session, in log order.
pub fn entries_for_session(entries: &[HistoryEntry], session_id: &str) -> Vec<HistoryEntry> {
    entries
        .iter()
        .filter(|entry| entry.session_id() == Some(session_id))
        .cloned()
        .collect()
}
