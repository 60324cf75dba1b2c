//! Typed error taxonomy for the orchestrator core.
//!
//! One enum per subsystem concern:
//! - `ConfigError` — unrecoverable startup failures (process exits 1)
//! - `BoardError` — remote board adapter failures
//! - `WorktreeError` — working-tree preparation and removal failures
//! - `RegistryError` — assignment registry contract violations
//! - `SupervisorError` — per-item lifecycle failures
//!
//! Supervisor-local errors terminate only their own assignment; they never
//! cross the orchestrator boundary as panics.

use crate::providers::Provider;
use crate::registry::AssignmentStatus;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Fatal startup failures. The process logs these and exits with code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "Missing board credentials: set AUTONOMOUS_BOARD_TOKEN (or GITHUB_TOKEN) \
         or [board].token in autonomous.toml"
    )]
    MissingCredentials,

    #[error("Failed to read configuration at {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration at {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("Not a git repository: {path}")]
    RepositoryNotFound { path: PathBuf },

    #[error("Repository at {path} has no default branch")]
    NoDefaultBranch { path: PathBuf },
}

/// Remote board adapter failures.
///
/// Transient variants are retried on the next reconciliation cycle; the
/// `*_with_sync` registry operations degrade to local-only with a warning.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Board unavailable: {0}")]
    Unavailable(String),

    #[error("Board authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Board item not found: {0}")]
    ItemNotFound(String),

    #[error("Malformed board response: {0}")]
    Malformed(String),
}

impl BoardError {
    /// True for failures the next reconciliation cycle may clear on its own
    /// (network faults, 5xx, expired auth that the operator refreshes).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::AuthRejected(_))
    }
}

impl From<reqwest::Error> for BoardError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Self::AuthRejected(err.to_string());
            }
        }
        Self::Unavailable(err.to_string())
    }
}

/// Filesystem or git failures preparing or removing a working tree.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path exists but is not a registered working tree: {path}")]
    NotRegistered { path: PathBuf },
}

/// Assignment registry contract violations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Issue #{issue_number} already has a live assignment ({assignment_id})")]
    AlreadyAssigned {
        issue_number: u64,
        assignment_id: Uuid,
    },

    #[error("Assignment {0} not found")]
    NotFound(Uuid),

    #[error("Invalid status transition {from} -> {to} for assignment {assignment_id}")]
    InvalidTransition {
        assignment_id: Uuid,
        from: AssignmentStatus,
        to: AssignmentStatus,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

/// Per-item lifecycle failures. Terminal for the assignment, never for the
/// orchestrator.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No {provider} slot available")]
    NoSlotAvailable { provider: Provider },

    #[error("Failed to spawn worker process: {0}")]
    SpawnFailed(String),

    #[error("Worker instance {0} is not tracked")]
    UnknownInstance(String),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Board(#[from] BoardError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
