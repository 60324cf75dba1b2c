//! Transient per-instance session files.
//!
//! `sessions/instance-<instanceId>.json` records the live process behind an
//! instance so `autonomous status` and post-mortem debugging can see it.
//! Removed on clean stop; a leftover file after a crash is informational
//! only — nothing replays it.

use crate::providers::InstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub instance_id: InstanceId,
    pub process_id: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub assignment_id: Uuid,
    pub worktree_path: PathBuf,
}

impl SessionFile {
    pub fn path_for(sessions_dir: &Path, instance_id: &InstanceId) -> PathBuf {
        sessions_dir.join(format!("instance-{instance_id}.json"))
    }

    pub fn write(&self, sessions_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(sessions_dir)?;
        let path = Self::path_for(sessions_dir, &self.instance_id);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    pub fn remove(sessions_dir: &Path, instance_id: &InstanceId) -> std::io::Result<()> {
        let path = Self::path_for(sessions_dir, instance_id);
        match std::fs::remove_file(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// All session files currently on disk, skipping unreadable entries.
    pub fn load_all(sessions_dir: &Path) -> Vec<SessionFile> {
        let Ok(entries) = std::fs::read_dir(sessions_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_prefix("instance-")
                    .is_some_and(|rest| rest.ends_with(".json"))
            })
            .filter_map(|e| {
                let content = std::fs::read_to_string(e.path()).ok()?;
                serde_json::from_str(&content).ok()
            })
            .collect()
    }
}
