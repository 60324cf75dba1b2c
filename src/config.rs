//! Configuration loading and the on-disk layout.
//!
//! Three layers, later wins: `autonomous.toml` at the repository root,
//! `AUTONOMOUS_*` environment variables (a best-effort `.env` is loaded
//! first), then CLI flags. The runtime [`Config`] resolves the repository
//! root, the `.autonomous/` directory layout, board connection settings,
//! and provider slot capacities.

use crate::board::GithubBoardConfig;
use crate::errors::ConfigError;
use crate::providers::{InstanceId, Provider};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_FILE: &str = "autonomous.toml";

const TOKEN_ENV_VARS: &[&str] = &["AUTONOMOUS_BOARD_TOKEN", "GITHUB_TOKEN"];

/// Contents of `autonomous.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub board: BoardSection,
    #[serde(default)]
    pub providers: ProvidersSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardSection {
    /// Project node id (`PVT_...`).
    pub project_id: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    #[serde(default = "default_status_field")]
    pub status_field: String,
    #[serde(default = "default_instance_field")]
    pub instance_field: String,
    /// Prefer AUTONOMOUS_BOARD_TOKEN over committing a token here.
    pub token: Option<String>,
}

impl Default for BoardSection {
    fn default() -> Self {
        Self {
            project_id: None,
            owner: None,
            repo: None,
            status_field: default_status_field(),
            instance_field: default_instance_field(),
            token: None,
        }
    }
}

fn default_status_field() -> String {
    "Status".to_string()
}

fn default_instance_field() -> String {
    "Assigned Instance".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersSection {
    #[serde(default = "default_provider")]
    pub default: Provider,
    #[serde(default = "default_claude_capacity")]
    pub claude: usize,
    #[serde(default = "default_small_capacity")]
    pub gemini: usize,
    #[serde(default = "default_small_capacity")]
    pub codex: usize,
    /// Binary overrides, mainly for wrappers and tests.
    pub claude_cmd: Option<String>,
    pub gemini_cmd: Option<String>,
    pub codex_cmd: Option<String>,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            default: default_provider(),
            claude: default_claude_capacity(),
            gemini: default_small_capacity(),
            codex: default_small_capacity(),
            claude_cmd: None,
            gemini_cmd: None,
            codex_cmd: None,
        }
    }
}

fn default_provider() -> Provider {
    Provider::Claude
}

fn default_claude_capacity() -> usize {
    2
}

fn default_small_capacity() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorSection {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_reconcile_seconds")]
    pub reconcile_seconds: u64,
    #[serde(default = "default_board_timeout_seconds")]
    pub board_timeout_seconds: u64,
    /// Where working trees live, relative to the repository root.
    #[serde(default = "default_worktree_base")]
    pub worktree_base_dir: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            reconcile_seconds: default_reconcile_seconds(),
            board_timeout_seconds: default_board_timeout_seconds(),
            worktree_base_dir: default_worktree_base(),
        }
    }
}

fn default_tick_seconds() -> u64 {
    5
}

fn default_reconcile_seconds() -> u64 {
    60
}

fn default_board_timeout_seconds() -> u64 {
    30
}

fn default_worktree_base() -> String {
    "..".to_string()
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub repo_root: PathBuf,
    pub project_name: String,
    pub autonomous_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub worktree_base: PathBuf,
    pub epic: Option<String>,
    pub auto_merge: bool,
    pub verbose: bool,
    pub file: FileConfig,
}

impl Config {
    pub fn load(
        repo_root: PathBuf,
        epic: Option<String>,
        auto_merge: bool,
        verbose: bool,
    ) -> Result<Self, ConfigError> {
        let repo_root = repo_root
            .canonicalize()
            .map_err(|_| ConfigError::RepositoryNotFound {
                path: repo_root.clone(),
            })?;
        if git2::Repository::open(&repo_root).is_err() {
            return Err(ConfigError::RepositoryNotFound { path: repo_root });
        }

        let config_path = repo_root.join(CONFIG_FILE);
        let file = if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Unreadable {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&content).map_err(|e| ConfigError::Invalid {
                path: config_path.clone(),
                message: e.to_string(),
            })?
        } else {
            FileConfig::default()
        };

        let project_name = repo_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let autonomous_dir = repo_root.join(".autonomous");
        let worktree_base = repo_root.join(&file.orchestrator.worktree_base_dir);
        // Resolve `..` segments while the base exists; a not-yet-created
        // base stays as configured.
        let worktree_base = worktree_base.canonicalize().unwrap_or(worktree_base);

        Ok(Self {
            project_name,
            logs_dir: autonomous_dir.join("logs"),
            sessions_dir: autonomous_dir.join("sessions"),
            prompts_dir: autonomous_dir.join("prompts"),
            autonomous_dir,
            worktree_base,
            repo_root,
            epic,
            auto_merge,
            verbose,
            file,
        })
    }

    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in [&self.logs_dir, &self.sessions_dir, &self.prompts_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Unreadable {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Board token: environment first, then the config file.
    pub fn board_token(&self) -> Result<String, ConfigError> {
        for var in TOKEN_ENV_VARS {
            if let Ok(token) = std::env::var(var)
                && !token.trim().is_empty()
            {
                return Ok(token);
            }
        }
        self.file
            .board
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingCredentials)
    }

    pub fn board_config(&self) -> Result<GithubBoardConfig, ConfigError> {
        let board = &self.file.board;
        let require = |value: &Option<String>, key: &str| {
            value.clone().ok_or_else(|| ConfigError::Invalid {
                path: self.repo_root.join(CONFIG_FILE),
                message: format!("[board].{key} is required"),
            })
        };
        Ok(GithubBoardConfig {
            token: self.board_token()?,
            project_id: require(&board.project_id, "project_id")?,
            owner: require(&board.owner, "owner")?,
            repo: require(&board.repo, "repo")?,
            status_field: board.status_field.clone(),
            instance_field: board.instance_field.clone(),
            timeout: self.board_timeout(),
        })
    }

    pub fn capacities(&self) -> HashMap<Provider, usize> {
        let p = &self.file.providers;
        HashMap::from([
            (Provider::Claude, p.claude),
            (Provider::Gemini, p.gemini),
            (Provider::Codex, p.codex),
        ])
    }

    pub fn default_provider(&self) -> Provider {
        self.file.providers.default
    }

    /// Worker binary and arguments for a provider, honoring config
    /// overrides.
    pub fn worker_command(&self, provider: Provider) -> (String, Vec<String>) {
        let overridden = match provider {
            Provider::Claude => self.file.providers.claude_cmd.clone(),
            Provider::Gemini => self.file.providers.gemini_cmd.clone(),
            Provider::Codex => self.file.providers.codex_cmd.clone(),
        };
        (
            overridden.unwrap_or_else(|| provider.command()),
            provider.default_args(),
        )
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.file.orchestrator.tick_seconds.max(1))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.file.orchestrator.reconcile_seconds.max(1))
    }

    pub fn board_timeout(&self) -> Duration {
        Duration::from_secs(self.file.orchestrator.board_timeout_seconds.max(1))
    }

    /// `<baseDir>/<projectName>-issue-<N>`
    pub fn worktree_path_for(&self, issue_number: u64) -> PathBuf {
        self.worktree_base
            .join(format!("{}-issue-{issue_number}", self.project_name))
    }

    pub fn branch_for(&self, issue_number: u64) -> String {
        format!("issue-{issue_number}")
    }

    pub fn log_path_for(&self, instance_id: &InstanceId) -> PathBuf {
        self.logs_dir.join(format!("output-{instance_id}.log"))
    }

    pub fn prompt_path_for(&self, instance_id: &InstanceId) -> PathBuf {
        self.prompts_dir.join(format!("prompt-{instance_id}.txt"))
    }
}
