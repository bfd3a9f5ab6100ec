//! Root layout of the coordination directory and `conductor init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ConductorConfig, load_config, write_config};

pub const CONFIG_FILE: &str = "conductor.toml";
pub const LOCKS_DIR: &str = ".locks";
pub const REGISTRY_FILE: &str = "REGISTRY.md";
pub const EXECUTOR_LOG_FILE: &str = ".executor-output.log";

/// Subtrees of the goals directory, by lifecycle status.
pub const ACTIVE_DIR: &str = "active";
pub const ICED_DIR: &str = "iced";
pub const COMPLETED_DIR: &str = "history";

/// All canonical paths under a coordination root.
#[derive(Debug, Clone)]
pub struct RootPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub locks_dir: PathBuf,
    pub history_dir: PathBuf,
    pub goals_dir: PathBuf,
    pub registry_path: PathBuf,
    pub active_dir: PathBuf,
    pub iced_dir: PathBuf,
    pub completed_dir: PathBuf,
}

impl RootPaths {
    pub fn new(root: impl Into<PathBuf>, config: &ConductorConfig) -> Self {
        let root = root.into();
        let goals_dir = root.join(&config.goals_dir);
        Self {
            config_path: root.join(CONFIG_FILE),
            locks_dir: root.join(LOCKS_DIR),
            history_dir: root.join(format!(".{}", config.history_namespace)),
            registry_path: goals_dir.join(REGISTRY_FILE),
            active_dir: goals_dir.join(ACTIVE_DIR),
            iced_dir: goals_dir.join(ICED_DIR),
            completed_dir: goals_dir.join(COMPLETED_DIR),
            goals_dir,
            root,
        }
    }

    /// Load `conductor.toml` from `root` and resolve paths against it.
    pub fn load(root: impl Into<PathBuf>) -> Result<(Self, ConductorConfig)> {
        let root = root.into();
        let config = load_config(&root.join(CONFIG_FILE))?;
        Ok((Self::new(root, &config), config))
    }

    /// Goal subtrees in lookup order.
    pub fn goal_subtrees(&self) -> [&Path; 3] {
        [
            self.active_dir.as_path(),
            self.iced_dir.as_path(),
            self.completed_dir.as_path(),
        ]
    }
}

/// Options for `init_root`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config and registry.
    pub force: bool,
}

/// Create the coordination root scaffolding.
///
/// Directories are always ensured. Existing files are kept unless
/// `options.force` is set.
pub fn init_root(root: &Path, options: &InitOptions) -> Result<RootPaths> {
    if root.exists() && !root.is_dir() {
        return Err(anyhow!("conductor init: {} is not a directory", root.display()));
    }
    let config_path = root.join(CONFIG_FILE);
    let config = if config_path.exists() && !options.force {
        load_config(&config_path)?
    } else {
        let config = ConductorConfig::default();
        write_config(&config_path, &config)?;
        config
    };

    let paths = RootPaths::new(root, &config);
    create_dir(&paths.locks_dir)?;
    create_dir(&paths.history_dir)?;
    create_dir(&paths.goals_dir)?;
    for subtree in paths.goal_subtrees() {
        create_dir(subtree)?;
    }

    if options.force || !paths.registry_path.exists() {
        fs::write(&paths.registry_path, REGISTRY_PLACEHOLDER)
            .with_context(|| format!("write {}", paths.registry_path.display()))?;
    }

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const REGISTRY_PLACEHOLDER: &str = "# Goal Registry\n\n";
