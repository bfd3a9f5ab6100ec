//! Context prompt handed to a freshly spawned executor.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use super::goal::GoalDetail;

const EXECUTOR_CONTEXT_TEMPLATE: &str = include_str!("prompts/executor_context.md");

/// Everything the executor needs to find its way back to the hub.
#[derive(Debug, Clone)]
pub struct ExecutorPrompt<'a> {
    pub goal_id: &'a str,
    pub session_id: &'a str,
    /// `meta` or `project`.
    pub executor_type: &'a str,
    /// Execution mode requested by the spawner, e.g. `autonomous`.
    pub mode: &'a str,
    pub project: Option<&'a str>,
    pub cwd: &'a Path,
    pub callback_url: &'a str,
    pub goal: Option<&'a GoalDetail>,
    /// Caller-supplied instructions, appended verbatim.
    pub context: Option<&'a str>,
}

/// Render the executor context prompt.
pub fn render_executor_prompt(input: &ExecutorPrompt<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template("executor_context", EXECUTOR_CONTEXT_TEMPLATE)
        .context("load executor context template")?;
    let template = env
        .get_template("executor_context")
        .context("get executor context template")?;

    let rendered = template
        .render(context! {
            goal_id => input.goal_id,
            session_id => input.session_id,
            executor_type => input.executor_type,
            mode => input.mode,
            project => input.project,
            cwd => input.cwd.display().to_string(),
            callback_url => input.callback_url.trim_end_matches('/'),
            title => input.goal.and_then(|g| g.title.as_deref()),
            goal_path => input.goal.map(|g| g.path.display().to_string()),
            status => input.goal.map(|g| g.status.as_str()),
            context => input.context.map(str::trim).filter(|s| !s.is_empty()),
        })
        .context("render executor context")?;
    Ok(rendered)
}
