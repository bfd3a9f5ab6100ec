//! Project lookup over `[projects.<name>]` in `conductor.toml`.

use std::path::PathBuf;

use serde::Serialize;

use super::config::ConductorConfig;

/// Workspace and base branch for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectInfo {
    pub name: String,
    /// Directory holding the project's goal worktrees.
    pub workspace: PathBuf,
    pub base_branch: String,
    /// Main checkout that worktrees are created from.
    pub repo: PathBuf,
}

pub trait ProjectLookup: Send + Sync {
    fn project(&self, name: &str) -> Option<ProjectInfo>;
}

/// Projects declared in configuration. Relative paths resolve against `root`.
#[derive(Debug, Clone)]
pub struct ConfigProjects {
    root: PathBuf,
    config: ConductorConfig,
}

impl ConfigProjects {
    pub fn new(root: impl Into<PathBuf>, config: &ConductorConfig) -> Self {
        Self {
            root: root.into(),
            config: config.clone(),
        }
    }
}

impl ProjectLookup for ConfigProjects {
    fn project(&self, name: &str) -> Option<ProjectInfo> {
        let cfg = self.config.projects.get(name)?;
        let workspace = self.root.join(&cfg.workspace);
        let repo = cfg
            .repo
            .as_ref()
            .map_or_else(|| workspace.clone(), |repo| self.root.join(repo));
        Some(ProjectInfo {
            name: name.to_string(),
            workspace,
            base_branch: cfg.base_branch.clone(),
            repo,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::ProjectConfig;

    #[test]
    fn resolves_paths_against_root() {
        let mut cfg = ConductorConfig::default();
        cfg.projects.insert(
            "P".to_string(),
            ProjectConfig {
                workspace: PathBuf::from("work/p"),
                base_branch: "trunk".to_string(),
                repo: None,
            },
        );
        cfg.projects.insert(
            "Q".to_string(),
            ProjectConfig {
                workspace: PathBuf::from("/abs/q"),
                base_branch: "main".to_string(),
                repo: Some(PathBuf::from("repos/q")),
            },
        );
        let projects = ConfigProjects::new("/r", &cfg);

        let p = projects.project("P").expect("P");
        assert_eq!(p.workspace, PathBuf::from("/r/work/p"));
        assert_eq!(p.repo, p.workspace);
        assert_eq!(p.base_branch, "trunk");

        let q = projects.project("Q").expect("Q");
        assert_eq!(q.workspace, PathBuf::from("/abs/q"));
        assert_eq!(q.repo, PathBuf::from("/r/repos/q"));

        assert!(projects.project("missing").is_none());
    }
}
