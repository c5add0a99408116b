//! Initialization of `.morty/` scaffolding and the initial status file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::io::config::{MortyConfig, PathsConfig, write_config};
use crate::io::git::{Git, GitOps};
use crate::io::state_store::{FileStateStore, StateStore, generate_status};

/// Canonical paths for a project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MortyPaths {
    pub root: PathBuf,
    pub morty_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub logs_dir: PathBuf,
    pub plan_dir: PathBuf,
    pub status_path: PathBuf,
    pub prompt_path: Option<PathBuf>,
}

impl MortyPaths {
    /// Paths with the default layout. Use [`MortyPaths::with_config`] once config is loaded.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::resolve(root.into(), &PathsConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: &MortyConfig) -> Self {
        Self::resolve(root.into(), &config.paths)
    }

    fn resolve(root: PathBuf, paths: &PathsConfig) -> Self {
        let morty_dir = root.join(".morty");
        Self {
            config_path: morty_dir.join("config.toml"),
            gitignore_path: morty_dir.join(".gitignore"),
            logs_dir: morty_dir.join("logs"),
            plan_dir: root.join(&paths.plan_dir),
            status_path: root.join(&paths.status_file),
            prompt_path: paths.prompt_file.as_ref().map(|p| root.join(p)),
            morty_dir,
            root,
        }
    }

    /// Log file for one agent run.
    pub fn agent_log_path(&self, module: &str, job: &str, loop_number: u32) -> PathBuf {
        self.logs_dir
            .join(format!("loop{loop_number:04}_{module}_{job}.log"))
    }
}

/// Options for [`init_workspace`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Regenerate the status file even if it exists.
    pub force: bool,
}

/// What [`init_workspace`] did.
#[derive(Debug, Clone)]
pub struct InitReport {
    pub paths: MortyPaths,
    pub modules: usize,
    pub jobs: usize,
    pub created_repo: bool,
}

/// Write default config and ignore files if missing, generate the status file,
/// and make sure `root` is a git repository.
///
/// Fails if the status file already exists unless `options.force` is set.
#[instrument(skip_all, fields(root = %root.display(), force = options.force))]
pub fn init_workspace(root: &Path, options: InitOptions) -> Result<InitReport> {
    let default_paths = MortyPaths::new(root);
    if default_paths.morty_dir.exists() && !default_paths.morty_dir.is_dir() {
        return Err(anyhow!("morty init: .morty exists but is not a directory"));
    }
    fs::create_dir_all(&default_paths.morty_dir).with_context(|| {
        format!("create directory {}", default_paths.morty_dir.display())
    })?;

    let config = if default_paths.config_path.exists() {
        crate::io::config::load_config(&default_paths.config_path)?
    } else {
        let config = MortyConfig::default();
        write_config(&default_paths.config_path, &config)?;
        config
    };
    let paths = MortyPaths::with_config(root, &config);

    if paths.status_path.exists() && !options.force {
        return Err(anyhow!(
            "morty init: {} already exists (use --force to regenerate)",
            paths.status_path.display()
        ));
    }
    ensure_gitignore(&paths)?;

    let state = generate_status(&paths.plan_dir)?;
    let modules = state.modules.len();
    let jobs = state.job_counts().total();
    FileStateStore::new(&paths.status_path, state).save()?;

    let created_repo = Git::new(root).init_if_needed()?;
    info!(modules, jobs, created_repo, "workspace initialized");

    Ok(InitReport {
        paths,
        modules,
        jobs,
        created_repo,
    })
}

/// Open the status file, generating and saving it from the plans if it does not exist.
#[instrument(skip_all, fields(status = %paths.status_path.display()))]
pub fn open_or_generate_status(paths: &MortyPaths) -> Result<FileStateStore> {
    if paths.status_path.exists() {
        return FileStateStore::open(&paths.status_path);
    }
    let state = generate_status(&paths.plan_dir).with_context(|| {
        format!(
            "{} not found, generating it from {}",
            paths.status_path.display(),
            paths.plan_dir.display()
        )
    })?;
    fs::create_dir_all(&paths.morty_dir)
        .with_context(|| format!("create directory {}", paths.morty_dir.display()))?;
    ensure_gitignore(paths)?;
    let mut store = FileStateStore::new(&paths.status_path, state);
    store.save()?;
    info!(modules = store.state().modules.len(), "status file generated from plans");
    Ok(store)
}

fn ensure_gitignore(paths: &MortyPaths) -> Result<()> {
    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, MORTY_GITIGNORE)
            .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    }
    Ok(())
}

const MORTY_GITIGNORE: &str = "logs/\n*.tmp\n";
