//! Spawning real child processes through the hub and observing their lifecycle.

#![cfg(unix)]

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use conductor::io::config::ConductorConfig;
use conductor::io::goal::FsGoals;
use conductor::test_support::{TestRoot, add_project, scaffold_root_with, scripted_executor};
use conductor_hub::hub::{Hub, HubEvent, HubOptions, SessionInfo, Subscription};
use conductor_hub::spawner::{SpawnError, SpawnRequest};
use conductor_hub::state::AppState;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);
const LOCAL: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

fn setup(script: &str) -> (TestRoot, TempDir, AppState) {
    let workspace = tempfile::tempdir().expect("workspace");
    fs::create_dir_all(workspace.path().join("goal-g1-x")).expect("worktree dir");

    let mut config = ConductorConfig::default();
    scripted_executor(&mut config, script);
    add_project(&mut config, "P", workspace.path());
    let root = scaffold_root_with(&config);
    let state = AppState::new(root.paths.clone(), &config, LOCAL);
    (root, workspace, state)
}

fn project_request(goal_id: &str) -> SpawnRequest {
    SpawnRequest {
        goal_id: goal_id.to_string(),
        project: Some("P".to_string()),
        ..SpawnRequest::default()
    }
}

/// Wait for the stop event of `session_id`; returns (reason, output tail).
async fn wait_for_stop(sub: &mut Subscription, session_id: &str) -> (String, String) {
    tokio::time::timeout(WAIT, async {
        loop {
            match sub.recv().await {
                Some(HubEvent::ExecutorStopped {
                    session_id: stopped,
                    reason,
                    output_tail,
                    ..
                }) if stopped == session_id => return (reason, output_tail),
                Some(_) => continue,
                None => panic!("subscription closed"),
            }
        }
    })
    .await
    .expect("executor stop event")
}

#[tokio::test(flavor = "multi_thread")]
async fn project_executor_runs_in_goal_worktree_and_completes() {
    let (_root, workspace, state) = setup("echo \"hello from $CONDUCTOR_GOAL_ID\"");
    let mut sub = state.hub.subscribe();

    let result = state
        .spawner
        .spawn(project_request("g1"))
        .await
        .expect("spawn");
    let expected_cwd = workspace.path().join("goal-g1-x");
    assert_eq!(result.cwd, expected_cwd);
    assert!(result.session_id.starts_with("sess-"));

    let (reason, tail) = wait_for_stop(&mut sub, &result.session_id).await;
    assert_eq!(reason, "completed");
    assert!(tail.contains("hello from g1"), "tail: {tail:?}");
    assert!(state.hub.active_session("g1").is_none());

    let sessions = state.hub.goal_sessions("g1").expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].stop_reason.as_deref(), Some("completed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn live_executor_is_listed_then_terminated() {
    let (_root, workspace, state) = setup("sleep 30");
    let mut sub = state.hub.subscribe();

    let result = state
        .spawner
        .spawn(project_request("g1"))
        .await
        .expect("spawn");

    let active = state.hub.active_executors();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, result.session_id);
    assert_eq!(active[0].cwd, workspace.path().join("goal-g1-x"));

    let stopped = state.spawner.terminate("g1").expect("terminate");
    assert_eq!(stopped, result.session_id);
    let (reason, _) = wait_for_stop(&mut sub, &result.session_id).await;
    assert_eq!(reason, "stopped");
    assert!(state.hub.active_executors().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_spawns_for_one_goal_start_exactly_one_executor() {
    let (_root, _workspace, state) = setup("sleep 30");
    let mut sub = state.hub.subscribe();

    let (a, b) = tokio::join!(
        state.spawner.spawn(project_request("g1")),
        state.spawner.spawn(project_request("g1")),
    );
    let (ok, err) = match (a, b) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        other => panic!("expected one success and one failure, got {other:?}"),
    };
    match err {
        SpawnError::AlreadyRunning { session_id, .. } => assert_eq!(session_id, ok.session_id),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(state.hub.active_executors().len(), 1);

    state.spawner.terminate("g1").expect("terminate");
    wait_for_stop(&mut sub, &ok.session_id).await;
}

#[tokio::test]
async fn spawn_rejects_bad_requests_before_starting_anything() {
    let (_root, _workspace, state) = setup("true");

    let conflicting = SpawnRequest {
        meta: true,
        ..project_request("g1")
    };
    assert!(matches!(
        state.spawner.spawn(conflicting).await,
        Err(SpawnError::ConflictingMode)
    ));

    let unknown = SpawnRequest {
        project: Some("nope".to_string()),
        ..project_request("g1")
    };
    assert!(matches!(
        state.spawner.spawn(unknown).await,
        Err(SpawnError::ProjectNotFound(name)) if name == "nope"
    ));

    assert!(matches!(
        state.spawner.spawn(project_request("g9")).await,
        Err(SpawnError::WorktreeNotFound { .. })
    ));
    assert!(matches!(
        state.spawner.spawn(project_request("../x")).await,
        Err(SpawnError::InvalidGoalId(_))
    ));
    assert!(state.hub.active_executors().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn meta_executor_gets_goal_folder_and_history_survives_restart() {
    let (root, _workspace, state) = setup("pwd; sleep 1");
    let mut sub = state.hub.subscribe();

    let result = state
        .spawner
        .spawn(SpawnRequest {
            goal_id: "g2".to_string(),
            meta: true,
            ..SpawnRequest::default()
        })
        .await
        .expect("spawn");
    assert_eq!(result.cwd, root.paths.active_dir.join("g2"));
    state
        .hub
        .attach_session_info(
            "g2",
            Some(&result.session_id),
            &SessionInfo {
                claude_session_id: Some("agent-42".to_string()),
                transcript_path: Some("/tmp/agent-42.jsonl".to_string()),
            },
        )
        .expect("attach while running");
    let (reason, tail) = wait_for_stop(&mut sub, &result.session_id).await;
    assert_eq!(reason, "completed");
    assert!(tail.trim_end().ends_with("g2"), "tail: {tail:?}");

    let restarted = Hub::new(
        HubOptions {
            history_dir: root.paths.history_dir.clone(),
            addr: LOCAL,
            output_tail_bytes: 4_000,
            output_tail_lines: 40,
        },
        Arc::new(FsGoals::new(&root.paths)),
    );
    let sessions = restarted.goal_sessions("g2").expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, result.session_id);
    assert_eq!(sessions[0].stop_reason.as_deref(), Some("completed"));
    assert_eq!(sessions[0].claude_session_id.as_deref(), Some("agent-42"));
    assert_eq!(
        sessions[0].transcript_path.as_deref(),
        Some("/tmp/agent-42.jsonl")
    );
    assert!(restarted.active_executors().is_empty());
}
