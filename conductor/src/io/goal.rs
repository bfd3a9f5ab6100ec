//! Goal lookup over the goal subtrees.
//!
//! Goals are markdown documents owned by the registry tooling; here we only
//! need enough of them to label an executor: id, title, status, and where the
//! file lives. A goal is either `<subtree>/<id>.md` or a folder
//! `<subtree>/<id>/GOAL.md`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde::Serialize;

use super::init::RootPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Iced,
    Completed,
}

impl GoalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GoalStatus::Active => "active",
            GoalStatus::Iced => "iced",
            GoalStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoalDetail {
    pub id: String,
    pub title: Option<String>,
    pub status: GoalStatus,
    pub path: PathBuf,
}

pub trait GoalLookup: Send + Sync {
    fn goal(&self, id: &str) -> Option<GoalDetail>;
}

/// Goals read straight from disk on every lookup.
#[derive(Debug, Clone)]
pub struct FsGoals {
    subtrees: [(PathBuf, GoalStatus); 3],
}

impl FsGoals {
    pub fn new(paths: &RootPaths) -> Self {
        Self {
            subtrees: [
                (paths.active_dir.clone(), GoalStatus::Active),
                (paths.iced_dir.clone(), GoalStatus::Iced),
                (paths.completed_dir.clone(), GoalStatus::Completed),
            ],
        }
    }
}

impl GoalLookup for FsGoals {
    fn goal(&self, id: &str) -> Option<GoalDetail> {
        if validate_id(id).is_err() {
            return None;
        }
        for (dir, status) in &self.subtrees {
            let candidates = [dir.join(format!("{id}.md")), dir.join(id).join("GOAL.md")];
            for path in candidates {
                let Ok(contents) = fs::read_to_string(&path) else {
                    continue;
                };
                return Some(GoalDetail {
                    id: id.to_string(),
                    title: parse_title(&contents),
                    status: *status,
                    path,
                });
            }
        }
        None
    }
}

/// Validate that an id is safe to use in paths and branch names.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("id must not be '{id}'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Frontmatter `title`, else the first `# ` heading.
fn parse_title(contents: &str) -> Option<String> {
    let body = match split_frontmatter(contents) {
        Some((frontmatter, rest)) => {
            if let Some(title) = frontmatter_value(frontmatter, "title") {
                return Some(title);
            }
            rest
        }
        None => contents,
    };
    body.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

fn frontmatter_value(frontmatter: &str, key: &str) -> Option<String> {
    for line in frontmatter.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((k, value)) = trimmed.split_once(':') else {
            continue;
        };
        if k.trim() != key {
            continue;
        }
        let v = value.trim();
        let v = if v.len() >= 2
            && ((v.starts_with('"') && v.ends_with('"'))
                || (v.starts_with('\'') && v.ends_with('\'')))
        {
            &v[1..v.len() - 1]
        } else {
            v
        };
        return (!v.is_empty()).then(|| v.to_string());
    }
    None
}

/// Split a document into (frontmatter, rest). None if there is no frontmatter.
fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let after = contents.strip_prefix("---\n")?;
    let end = after.find("\n---\n")?;
    Some((&after[..end], &after[end + 5..]))
}

/// Goal id from a path below one of the goal subtrees.
pub fn goal_id_from_relative(rel: &Path) -> Option<String> {
    let first = rel.components().next()?;
    let name = first.as_os_str().to_str()?;
    let id = name.strip_suffix(".md").unwrap_or(name);
    (!id.is_empty()).then(|| id.to_string())
}
