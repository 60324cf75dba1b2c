//! Worker CLI providers and instance identity.
//!
//! The core is provider-agnostic: everything provider-specific lives here as
//! a small capability set (command, default arguments, environment variable
//! names, installed/version probes). `ProcessSupervisor` and the lifecycle
//! supervisor consume these values without branching on the provider.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::process::Command;

/// The three supported code-generation CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Gemini,
    Codex,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Claude, Provider::Gemini, Provider::Codex];

    /// Lowercase provider name, also the slot-id prefix.
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Gemini => "gemini",
            Provider::Codex => "codex",
        }
    }

    /// The CLI binary to launch. Overridable via `CLAUDE_CMD` / `GEMINI_CMD` /
    /// `CODEX_CMD` for wrappers and test stubs.
    pub fn command(&self) -> String {
        std::env::var(self.command_env_var()).unwrap_or_else(|_| self.name().to_string())
    }

    fn command_env_var(&self) -> &'static str {
        match self {
            Provider::Claude => "CLAUDE_CMD",
            Provider::Gemini => "GEMINI_CMD",
            Provider::Codex => "CODEX_CMD",
        }
    }

    /// Arguments that put the CLI in non-interactive, auto-approving mode.
    pub fn default_args(&self) -> Vec<String> {
        match self {
            Provider::Claude => vec!["--dangerously-skip-permissions".to_string()],
            Provider::Gemini => vec!["--yolo".to_string()],
            Provider::Codex => vec!["--full-auto".to_string()],
        }
    }

    /// Name of the environment variable carrying the instance id into the
    /// worker process (`<TOOL>_INSTANCE_ID`).
    pub fn instance_env_var(&self) -> &'static str {
        match self {
            Provider::Claude => "CLAUDE_INSTANCE_ID",
            Provider::Gemini => "GEMINI_INSTANCE_ID",
            Provider::Codex => "CODEX_INSTANCE_ID",
        }
    }

    /// Whether the CLI is on PATH and answers `--version`.
    pub async fn installed(&self) -> bool {
        self.version().await.is_some()
    }

    /// The CLI's reported version, if it is installed.
    pub async fn version(&self) -> Option<String> {
        let output = Command::new(self.command())
            .arg("--version")
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().next()?.trim();
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Provider::Claude),
            "gemini" => Ok(Provider::Gemini),
            "codex" => Ok(Provider::Codex),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// A named slot ticket: `<provider>-<slot>`, e.g. `claude-0`.
///
/// At most one live worker process exists per instance id; the slot allocator
/// is the only issuer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct InstanceId {
    pub provider: Provider,
    pub slot: usize,
}

impl InstanceId {
    pub fn new(provider: Provider, slot: usize) -> Self {
        Self { provider, slot }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.provider, self.slot)
    }
}

impl FromStr for InstanceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, slot) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("malformed instance id: {s}"))?;
        let provider = Provider::from_str(name)?;
        let slot = slot
            .parse::<usize>()
            .map_err(|_| format!("malformed slot index in instance id: {s}"))?;
        Ok(Self { provider, slot })
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for InstanceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
