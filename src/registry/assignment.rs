//! Assignment model: the core's record of one attempt to implement one issue.

use crate::providers::{InstanceId, Provider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Assignment lifecycle states.
///
/// `assigned → in-progress → {dev-complete | blocked | failed}`, and only
/// `dev-complete` can advance to `merged`. `blocked` and `failed` are
/// terminal-but-unsuccessful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentStatus {
    Assigned,
    InProgress,
    DevComplete,
    Blocked,
    Failed,
    Merged,
}

impl AssignmentStatus {
    /// Successful terminal states.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::DevComplete | Self::Merged)
    }

    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, Self::Blocked | Self::Failed)
    }

    /// States with an active claim on a slot and (usually) a process.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    /// Whether the state machine permits `self → to`.
    pub fn can_transition(&self, to: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, to),
            (Assigned, InProgress)
                | (Assigned, Blocked)
                | (Assigned, Failed)
                | (InProgress, DevComplete)
                | (InProgress, Blocked)
                | (InProgress, Failed)
                | (DevComplete, Merged)
        )
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Assigned => "assigned",
            Self::InProgress => "in-progress",
            Self::DevComplete => "dev-complete",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Merged => "merged",
        };
        f.write_str(name)
    }
}

/// One worker launch within an assignment (at most two: the initial run and
/// the single resurrection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSession {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub prompt_used: String,
    pub summary: Option<String>,
}

impl WorkSession {
    pub fn begin(prompt_used: String) -> Self {
        Self {
            started_at: Utc::now(),
            ended_at: None,
            prompt_used,
            summary: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AssignmentMetadata {
    pub requires_tests: bool,
    pub requires_ci: bool,
    pub is_phase_master: bool,
}

impl Default for AssignmentMetadata {
    fn default() -> Self {
        Self {
            requires_tests: true,
            requires_ci: false,
            is_phase_master: false,
        }
    }
}

/// Input for [`crate::registry::AssignmentRegistry::create`].
#[derive(Debug, Clone)]
pub struct CreateAssignment {
    pub issue_number: u64,
    pub instance_id: InstanceId,
    pub provider: Provider,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub board_item_id: Option<String>,
    pub metadata: AssignmentMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: Uuid,
    pub issue_number: u64,
    pub instance_id: InstanceId,
    pub board_item_id: Option<String>,
    pub provider: Provider,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub status: AssignmentStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub work_sessions: Vec<WorkSession>,
    pub metadata: AssignmentMetadata,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub ci_status: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Assignment {
    pub(crate) fn new(input: CreateAssignment) -> Self {
        Self {
            assignment_id: Uuid::new_v4(),
            issue_number: input.issue_number,
            instance_id: input.instance_id,
            board_item_id: input.board_item_id,
            provider: input.provider,
            worktree_path: input.worktree_path,
            branch_name: input.branch_name,
            status: AssignmentStatus::Assigned,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            merged_at: None,
            work_sessions: Vec::new(),
            metadata: input.metadata,
            pr_number: None,
            pr_url: None,
            ci_status: None,
            last_activity: None,
        }
    }

    pub fn last_session(&self) -> Option<&WorkSession> {
        self.work_sessions.last()
    }

    /// Stamp the first-entry timestamp for `status`. Called by the registry
    /// after a transition is validated.
    pub(crate) fn note_entered(&mut self, status: AssignmentStatus) {
        let now = Utc::now();
        match status {
            AssignmentStatus::InProgress => {
                self.started_at.get_or_insert(now);
            }
            AssignmentStatus::DevComplete
            | AssignmentStatus::Blocked
            | AssignmentStatus::Failed => {
                self.completed_at.get_or_insert(now);
            }
            AssignmentStatus::Merged => {
                self.merged_at.get_or_insert(now);
            }
            AssignmentStatus::Assigned => {}
        }
        self.last_activity = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_input(issue: u64) -> CreateAssignment {
        CreateAssignment {
            issue_number: issue,
            instance_id: "claude-0".parse().unwrap(),
            provider: Provider::Claude,
            worktree_path: PathBuf::from("/tmp/widget-issue-42"),
            branch_name: "issue-42".to_string(),
            board_item_id: None,
            metadata: AssignmentMetadata::default(),
        }
    }

    #[test]
    fn test_new_assignment_starts_assigned() {
        let a = Assignment::new(create_input(42));
        assert_eq!(a.status, AssignmentStatus::Assigned);
        assert!(a.started_at.is_none());
        assert!(a.work_sessions.is_empty());
    }

    #[test]
    fn test_status_machine_happy_path() {
        use AssignmentStatus::*;
        assert!(Assigned.can_transition(InProgress));
        assert!(InProgress.can_transition(DevComplete));
        assert!(DevComplete.can_transition(Merged));
    }

    #[test]
    fn test_status_machine_rejects_skips_and_reversals() {
        use AssignmentStatus::*;
        assert!(!Assigned.can_transition(DevComplete));
        assert!(!Assigned.can_transition(Merged));
        assert!(!DevComplete.can_transition(InProgress));
        assert!(!Merged.can_transition(InProgress));
        assert!(!Failed.can_transition(InProgress));
        assert!(!Blocked.can_transition(DevComplete));
        assert!(!InProgress.can_transition(Merged));
    }

    #[test]
    fn test_failure_allowed_before_launch() {
        use AssignmentStatus::*;
        // Worktree preparation can fail before the process ever starts.
        assert!(Assigned.can_transition(Failed));
        assert!(Assigned.can_transition(Blocked));
    }

    #[test]
    fn test_done_and_unsuccessful_partitions() {
        use AssignmentStatus::*;
        assert!(DevComplete.is_done());
        assert!(Merged.is_done());
        assert!(!Blocked.is_done());
        assert!(Blocked.is_unsuccessful());
        assert!(Failed.is_unsuccessful());
        assert!(Assigned.is_live());
        assert!(InProgress.is_live());
        assert!(!DevComplete.is_live());
    }

    #[test]
    fn test_status_serde_kebab_case() {
        let json = serde_json::to_string(&AssignmentStatus::DevComplete).unwrap();
        assert_eq!(json, "\"dev-complete\"");
        let back: AssignmentStatus = serde_json::from_str("\"in-progress\"").unwrap();
        assert_eq!(back, AssignmentStatus::InProgress);
    }

    #[test]
    fn test_note_entered_stamps_once() {
        let mut a = Assignment::new(create_input(1));
        a.note_entered(AssignmentStatus::InProgress);
        let first = a.started_at.unwrap();
        a.note_entered(AssignmentStatus::InProgress);
        assert_eq!(a.started_at.unwrap(), first);
        assert!(a.last_activity.is_some());
    }
}
