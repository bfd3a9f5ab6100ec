//! File change watcher for the goal subtrees and the registry.
//!
//! Executors write markdown as a side channel. Raw notifications are
//! filtered to `.md`, classified by location, debounced per path, and
//! republished through the hub.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor::io::goal::goal_id_from_relative;
use conductor::io::init::RootPaths;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hub::{Hub, HubEvent};

#[derive(Debug, Clone, Copy)]
enum Area {
    Active,
    Iced,
    Completed,
}

/// Map a changed path to the hub event it represents.
///
/// Non-markdown files and paths outside the goals directory map to `None`.
pub fn classify(paths: &RootPaths, path: &Path) -> Option<HubEvent> {
    if path.extension().and_then(|e| e.to_str()) != Some("md") {
        return None;
    }
    if path == paths.registry_path {
        return Some(HubEvent::RegistryUpdated {
            path: path.to_path_buf(),
        });
    }

    for (dir, area) in [
        (&paths.active_dir, Area::Active),
        (&paths.iced_dir, Area::Iced),
        (&paths.completed_dir, Area::Completed),
    ] {
        if let Ok(rel) = path.strip_prefix(dir) {
            let goal_id = goal_id_from_relative(rel)?;
            let path = path.to_path_buf();
            return Some(match area {
                Area::Active => HubEvent::GoalUpdated { goal_id, path },
                Area::Iced => HubEvent::GoalIced { goal_id, path },
                Area::Completed => HubEvent::GoalCompleted { goal_id, path },
            });
        }
    }

    path.starts_with(&paths.goals_dir).then(|| HubEvent::FileChanged {
        path: path.to_path_buf(),
    })
}

/// Per-path debounce with leading and trailing edges.
///
/// The first event for a path is published immediately. Further events
/// inside the window are folded into one trailing event, released by
/// [`Debouncer::due`] once the window has passed.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    entries: HashMap<PathBuf, DebounceEntry>,
}

#[derive(Debug)]
struct DebounceEntry {
    last_emit: Instant,
    pending: bool,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an event; true if it should be published now.
    pub fn on_event(&mut self, path: &Path, now: Instant) -> bool {
        match self.entries.get_mut(path) {
            Some(entry) if now.duration_since(entry.last_emit) < self.window => {
                entry.pending = true;
                false
            }
            _ => {
                self.entries.insert(
                    path.to_path_buf(),
                    DebounceEntry {
                        last_emit: now,
                        pending: false,
                    },
                );
                true
            }
        }
    }

    /// Trailing events whose window has elapsed. Idle entries are pruned.
    pub fn due(&mut self, now: Instant) -> Vec<PathBuf> {
        let window = self.window;
        let mut ready = Vec::new();
        self.entries.retain(|path, entry| {
            if now.duration_since(entry.last_emit) < window {
                return true;
            }
            if entry.pending {
                ready.push(path.clone());
                entry.last_emit = now;
                entry.pending = false;
                return true;
            }
            false
        });
        ready.sort();
        ready
    }
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub debounce: Duration,
    pub poll_interval: Duration,
}

/// Start the watcher in a background task for the life of the process.
pub fn start_file_watcher(hub: Arc<Hub>, paths: RootPaths, options: WatcherOptions) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(hub, paths, options).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(
    hub: Arc<Hub>,
    paths: RootPaths,
    options: WatcherOptions,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(256);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| match res {
            Ok(event) => {
                if tx.try_send(event).is_err() {
                    debug!("watcher queue full, notification dropped");
                }
            }
            Err(err) => warn!(err = %err, "watch error"),
        },
        notify::Config::default().with_poll_interval(options.poll_interval),
    )?;

    let targets = [
        (paths.active_dir.as_path(), RecursiveMode::Recursive),
        (paths.iced_dir.as_path(), RecursiveMode::Recursive),
        (paths.completed_dir.as_path(), RecursiveMode::Recursive),
        (paths.registry_path.as_path(), RecursiveMode::NonRecursive),
    ];
    for (target, mode) in targets {
        match watcher.watch(target, mode) {
            Ok(()) => info!(path = %target.display(), "watching"),
            Err(err) => warn!(path = %target.display(), err = %err, "cannot watch, skipping"),
        }
    }

    let mut debouncer = Debouncer::new(options.debounce);
    let mut flush_tick =
        tokio::time::interval((options.debounce / 2).max(Duration::from_millis(10)));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                let now = Instant::now();
                for path in &event.paths {
                    if let Some(hub_event) = classify(&paths, path)
                        && debouncer.on_event(path, now)
                    {
                        debug!(path = %path.display(), event = hub_event.event_type(), "publishing file change");
                        hub.broadcast(hub_event);
                    }
                }
            }
            _ = flush_tick.tick() => {
                for path in debouncer.due(Instant::now()) {
                    if let Some(hub_event) = classify(&paths, &path) {
                        debug!(path = %path.display(), event = hub_event.event_type(), "publishing trailing change");
                        hub.broadcast(hub_event);
                    }
                }
            }
        }
    }

    drop(watcher);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor::io::config::ConductorConfig;

    fn paths() -> RootPaths {
        RootPaths::new("/r", &ConductorConfig::default())
    }

    #[test]
    fn classifies_by_subtree_and_extracts_goal_id() {
        let p = paths();
        assert!(matches!(
            classify(&p, Path::new("/r/goals/REGISTRY.md")),
            Some(HubEvent::RegistryUpdated { .. })
        ));
        assert!(matches!(
            classify(&p, Path::new("/r/goals/active/g1.md")),
            Some(HubEvent::GoalUpdated { goal_id, .. }) if goal_id == "g1"
        ));
        assert!(matches!(
            classify(&p, Path::new("/r/goals/iced/g2/PLAN.md")),
            Some(HubEvent::GoalIced { goal_id, .. }) if goal_id == "g2"
        ));
        assert!(matches!(
            classify(&p, Path::new("/r/goals/history/g3.md")),
            Some(HubEvent::GoalCompleted { goal_id, .. }) if goal_id == "g3"
        ));
        assert!(matches!(
            classify(&p, Path::new("/r/goals/notes.md")),
            Some(HubEvent::FileChanged { .. })
        ));
    }

    #[test]
    fn ignores_non_markdown_and_outside_paths() {
        let p = paths();
        assert!(classify(&p, Path::new("/r/goals/active/g1.json")).is_none());
        assert!(classify(&p, Path::new("/r/goals/active/g1/.executor-output.log")).is_none());
        assert!(classify(&p, Path::new("/elsewhere/readme.md")).is_none());
    }

    #[test]
    fn burst_of_five_publishes_at_most_twice() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let path = Path::new("/r/goals/active/g1.md");
        let start = Instant::now();

        let leading = (0..5)
            .filter(|i| debouncer.on_event(path, start + Duration::from_millis(10 * i)))
            .count();
        assert_eq!(leading, 1);
        assert!(debouncer.due(start + Duration::from_millis(100)).is_empty());

        let trailing = debouncer.due(start + Duration::from_millis(600));
        assert_eq!(trailing, vec![path.to_path_buf()]);
        assert!(debouncer.due(start + Duration::from_millis(1200)).is_empty());
    }

    #[test]
    fn single_event_has_no_trailing_edge() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let path = Path::new("/r/goals/REGISTRY.md");
        let start = Instant::now();
        assert!(debouncer.on_event(path, start));
        assert!(debouncer.due(start + Duration::from_secs(1)).is_empty());
        assert!(debouncer.on_event(path, start + Duration::from_secs(2)));
    }

    #[test]
    fn paths_debounce_independently() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let start = Instant::now();
        assert!(debouncer.on_event(Path::new("/a.md"), start));
        assert!(debouncer.on_event(Path::new("/b.md"), start));
        assert!(!debouncer.on_event(Path::new("/a.md"), start));
    }
}
