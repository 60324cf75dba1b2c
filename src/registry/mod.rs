//! In-memory assignment registry.
//!
//! The registry is the only shared mutable structure in the core. One
//! writer-preferring lock covers the primary map and both secondary indices;
//! reads hand out value copies so no caller ever holds the lock across I/O.
//! All board write-through here is best-effort: when the board is down the
//! local write still lands and reconciliation repairs the divergence later.

mod assignment;
mod sync;

pub use assignment::{
    Assignment, AssignmentMetadata, AssignmentStatus, CreateAssignment, WorkSession,
};
pub use sync::{SyncOutcome, SyncReport, sync_all_fields_from_board};

use crate::board::{Board, StatusMapping};
use crate::errors::RegistryError;
use crate::providers::InstanceId;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    by_id: HashMap<Uuid, Assignment>,
    by_issue: HashMap<u64, Uuid>,
    by_instance: HashMap<InstanceId, Uuid>,
}

pub struct AssignmentRegistry {
    inner: RwLock<Inner>,
    board: Arc<dyn Board>,
}

impl AssignmentRegistry {
    pub fn new(board: Arc<dyn Board>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            board,
        }
    }

    /// Create a fresh assignment with status `assigned`.
    ///
    /// Fails with `AlreadyAssigned` when the issue already has a live
    /// assignment — the at-most-one-per-issue invariant is enforced here,
    /// under the write lock, so concurrent creates cannot both win.
    pub fn create(&self, input: CreateAssignment) -> Result<Assignment, RegistryError> {
        let mut inner = self.inner.write();
        if let Some(existing_id) = inner.by_issue.get(&input.issue_number).copied() {
            return Err(RegistryError::AlreadyAssigned {
                issue_number: input.issue_number,
                assignment_id: existing_id,
            });
        }
        if inner.by_instance.contains_key(&input.instance_id) {
            return Err(RegistryError::InvariantViolation(format!(
                "instance {} already bound to a live assignment",
                input.instance_id
            )));
        }
        let assignment = Assignment::new(input);
        inner
            .by_issue
            .insert(assignment.issue_number, assignment.assignment_id);
        inner
            .by_instance
            .insert(assignment.instance_id.clone(), assignment.assignment_id);
        inner
            .by_id
            .insert(assignment.assignment_id, assignment.clone());
        debug!(
            assignment_id = %assignment.assignment_id,
            issue = assignment.issue_number,
            instance = %assignment.instance_id,
            "assignment created"
        );
        Ok(assignment)
    }

    pub fn get(&self, id: Uuid) -> Option<Assignment> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn get_by_issue(&self, issue_number: u64) -> Option<Assignment> {
        let inner = self.inner.read();
        inner
            .by_issue
            .get(&issue_number)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn get_by_instance(&self, instance_id: &InstanceId) -> Option<Assignment> {
        let inner = self.inner.read();
        inner
            .by_instance
            .get(instance_id)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn list(&self) -> Vec<Assignment> {
        self.inner.read().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    fn with_assignment<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Assignment) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut inner = self.inner.write();
        let assignment = inner.by_id.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        f(assignment)
    }

    /// Transition an assignment's status, stamping first-entry timestamps.
    /// A same-status call is a no-op, not an error — supervisors and
    /// reconciliation may race to the same conclusion.
    pub fn update_status(
        &self,
        id: Uuid,
        new_status: AssignmentStatus,
    ) -> Result<Assignment, RegistryError> {
        self.with_assignment(id, |a| {
            if a.status == new_status {
                return Ok(a.clone());
            }
            if !a.status.can_transition(new_status) {
                return Err(RegistryError::InvalidTransition {
                    assignment_id: id,
                    from: a.status,
                    to: new_status,
                });
            }
            debug!(assignment_id = %id, from = %a.status, to = %new_status, "status transition");
            a.status = new_status;
            a.note_entered(new_status);
            Ok(a.clone())
        })
    }

    /// Local status write first, then best-effort write-through to the
    /// board. On entry into `dev-complete`, `merged`, `blocked`, or
    /// `failed` the board's Assigned Instance field is also cleared.
    ///
    /// Board failures degrade to a warning; the next reconciliation cycle
    /// resolves the divergence. The core never blocks on board I/O.
    pub async fn update_status_with_sync(
        &self,
        id: Uuid,
        new_status: AssignmentStatus,
    ) -> Result<Assignment, RegistryError> {
        let updated = self.update_status(id, new_status)?;

        let Some(board_item_id) = updated.board_item_id.clone() else {
            return Ok(updated);
        };

        if let Some(board_status) = StatusMapping::to_board(new_status) {
            if let Err(e) = self.board.set_status(&board_item_id, board_status).await {
                warn!(
                    assignment_id = %id,
                    status = board_status,
                    error = %e,
                    "board status write failed, continuing locally"
                );
            }
        }

        if !new_status.is_live() {
            if let Err(e) = self.board.set_assigned_instance(&board_item_id, None).await {
                warn!(
                    assignment_id = %id,
                    error = %e,
                    "board instance clear failed, continuing locally"
                );
            }
        }

        Ok(updated)
    }

    /// Start a new work session recording the prompt that launched it.
    pub fn append_work_session(&self, id: Uuid, prompt_used: String) -> Result<(), RegistryError> {
        self.with_assignment(id, |a| {
            a.work_sessions.push(WorkSession::begin(prompt_used));
            a.last_activity = Some(Utc::now());
            Ok(())
        })
    }

    /// Close the most recent work session, if one is open.
    pub fn end_last_session(
        &self,
        id: Uuid,
        summary: Option<String>,
    ) -> Result<(), RegistryError> {
        self.with_assignment(id, |a| {
            if let Some(session) = a.work_sessions.last_mut()
                && session.ended_at.is_none()
            {
                session.ended_at = Some(Utc::now());
                session.summary = summary;
            }
            a.last_activity = Some(Utc::now());
            Ok(())
        })
    }

    pub fn set_pr(
        &self,
        id: Uuid,
        pr_number: u64,
        pr_url: Option<String>,
    ) -> Result<(), RegistryError> {
        self.with_assignment(id, |a| {
            a.pr_number = Some(pr_number);
            a.pr_url = pr_url;
            a.last_activity = Some(Utc::now());
            Ok(())
        })
    }

    pub fn touch_activity(&self, id: Uuid) {
        let mut inner = self.inner.write();
        if let Some(a) = inner.by_id.get_mut(&id) {
            a.last_activity = Some(Utc::now());
        }
    }

    /// Remove an assignment and all its index entries.
    pub fn remove(&self, id: Uuid) -> Option<Assignment> {
        let mut inner = self.inner.write();
        let assignment = inner.by_id.remove(&id)?;
        inner.by_issue.remove(&assignment.issue_number);
        inner.by_instance.remove(&assignment.instance_id);
        debug!(assignment_id = %id, issue = assignment.issue_number, "assignment removed");
        Some(assignment)
    }

    /// Resolve and cache the board item id for an assignment.
    pub async fn ensure_board_item_id(&self, id: Uuid) -> Result<Option<String>, RegistryError> {
        let assignment = self.get(id).ok_or(RegistryError::NotFound(id))?;
        if assignment.board_item_id.is_some() {
            return Ok(assignment.board_item_id);
        }
        match self.board.get_item_for_issue(assignment.issue_number).await {
            Ok(Some(board_item_id)) => {
                self.with_assignment(id, |a| {
                    a.board_item_id = Some(board_item_id.clone());
                    Ok(())
                })?;
                Ok(Some(board_item_id))
            }
            Ok(None) => {
                warn!(
                    issue = assignment.issue_number,
                    "issue has no board item; board sync disabled for this assignment"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(issue = assignment.issue_number, error = %e, "board item lookup failed");
                Ok(None)
            }
        }
    }

    /// Fetch the board's status for an issue's assignment and, when it maps
    /// to a known status and differs, let the board win before returning
    /// the refreshed assignment.
    pub async fn load_with_conflict_detection(&self, issue_number: u64) -> Option<Assignment> {
        let assignment = self.get_by_issue(issue_number)?;
        let board_item_id = assignment.board_item_id.as_deref()?.to_string();

        let board_status = match self.board.get_status(&board_item_id).await {
            Ok(Some(name)) => name,
            Ok(None) => return Some(assignment),
            Err(e) => {
                warn!(issue = issue_number, error = %e, "conflict check skipped, board unavailable");
                return Some(assignment);
            }
        };

        let Some(mapped) = StatusMapping::to_assignment(&board_status) else {
            return Some(assignment);
        };
        if mapped == assignment.status {
            return Some(assignment);
        }

        warn!(
            issue = issue_number,
            local = %assignment.status,
            board = %board_status,
            "board status differs, board wins"
        );
        let mut inner = self.inner.write();
        let a = inner.by_id.get_mut(&assignment.assignment_id)?;
        a.status = mapped;
        a.note_entered(mapped);
        Some(a.clone())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::MemoryBoard;
    use crate::providers::Provider;
    use std::path::PathBuf;

    fn registry() -> (AssignmentRegistry, Arc<MemoryBoard>) {
        let board = Arc::new(MemoryBoard::new());
        (AssignmentRegistry::new(board.clone()), board)
    }

    fn create_input(issue: u64, instance: &str) -> CreateAssignment {
        CreateAssignment {
            issue_number: issue,
            instance_id: instance.parse().unwrap(),
            provider: Provider::Claude,
            worktree_path: PathBuf::from(format!("/tmp/widget-issue-{issue}")),
            branch_name: format!("issue-{issue}"),
            board_item_id: None,
            metadata: AssignmentMetadata::default(),
        }
    }

    fn board_item(n: u64, status: &str) -> crate::board::BoardItem {
        crate::board::BoardItem {
            board_item_id: format!("ITEM_{n}"),
            issue_number: n,
            title: format!("Issue {n}"),
            body: String::new(),
            status: status.to_string(),
            assigned_instance: None,
            field_map: Default::default(),
        }
    }

    #[test]
    fn test_create_and_lookups() {
        let (registry, _) = registry();
        let a = registry.create(create_input(42, "claude-0")).unwrap();
        assert_eq!(registry.get(a.assignment_id).unwrap().issue_number, 42);
        assert_eq!(
            registry.get_by_issue(42).unwrap().assignment_id,
            a.assignment_id
        );
        assert_eq!(
            registry
                .get_by_instance(&"claude-0".parse().unwrap())
                .unwrap()
                .assignment_id,
            a.assignment_id
        );
    }

    #[test]
    fn test_create_rejects_duplicate_issue() {
        let (registry, _) = registry();
        registry.create(create_input(42, "claude-0")).unwrap();
        let err = registry.create(create_input(42, "claude-1")).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyAssigned { issue_number: 42, .. }));
    }

    #[test]
    fn test_create_rejects_duplicate_instance() {
        let (registry, _) = registry();
        registry.create(create_input(42, "claude-0")).unwrap();
        let err = registry.create(create_input(43, "claude-0")).unwrap_err();
        assert!(matches!(err, RegistryError::InvariantViolation(_)));
    }

    #[test]
    fn test_concurrent_create_same_issue_single_winner() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        let mut handles = Vec::new();
        for slot in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                registry.create(create_input(42, &format!("claude-{slot}"))).is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_status_stamps_timestamps() {
        let (registry, _) = registry();
        let a = registry.create(create_input(1, "claude-0")).unwrap();
        let a = registry
            .update_status(a.assignment_id, AssignmentStatus::InProgress)
            .unwrap();
        assert!(a.started_at.is_some());
        let a = registry
            .update_status(a.assignment_id, AssignmentStatus::DevComplete)
            .unwrap();
        assert!(a.completed_at.is_some());
        let a = registry
            .update_status(a.assignment_id, AssignmentStatus::Merged)
            .unwrap();
        assert!(a.merged_at.is_some());
    }

    #[test]
    fn test_update_status_rejects_invalid_transition() {
        let (registry, _) = registry();
        let a = registry.create(create_input(1, "claude-0")).unwrap();
        let err = registry
            .update_status(a.assignment_id, AssignmentStatus::Merged)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn test_update_status_same_state_is_noop() {
        let (registry, _) = registry();
        let a = registry.create(create_input(1, "claude-0")).unwrap();
        registry
            .update_status(a.assignment_id, AssignmentStatus::Assigned)
            .unwrap();
    }

    #[tokio::test]
    async fn test_with_sync_writes_through_and_clears_instance() {
        let (registry, board) = registry();
        board.put(board_item(1, "Ready"));
        let a = registry.create(create_input(1, "claude-0")).unwrap();
        registry.ensure_board_item_id(a.assignment_id).await.unwrap();

        registry
            .update_status_with_sync(a.assignment_id, AssignmentStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(board.snapshot("ITEM_1").unwrap().status, "In Progress");

        board
            .set_assigned_instance("ITEM_1", Some("claude-0"))
            .await
            .unwrap();
        registry
            .update_status_with_sync(a.assignment_id, AssignmentStatus::DevComplete)
            .await
            .unwrap();
        let item = board.snapshot("ITEM_1").unwrap();
        assert_eq!(item.status, "Dev Complete");
        assert_eq!(item.assigned_instance, None);
    }

    #[tokio::test]
    async fn test_with_sync_failed_clears_instance_without_status_write() {
        let (registry, board) = registry();
        board.put(board_item(1, "In Progress"));
        let a = registry.create(create_input(1, "claude-0")).unwrap();
        registry.ensure_board_item_id(a.assignment_id).await.unwrap();
        board
            .set_assigned_instance("ITEM_1", Some("claude-0"))
            .await
            .unwrap();
        registry
            .update_status(a.assignment_id, AssignmentStatus::InProgress)
            .unwrap();

        registry
            .update_status_with_sync(a.assignment_id, AssignmentStatus::Failed)
            .await
            .unwrap();
        let item = board.snapshot("ITEM_1").unwrap();
        // Failure never writes a status name; the operator owns that column.
        assert_eq!(item.status, "In Progress");
        assert_eq!(item.assigned_instance, None);
    }

    #[tokio::test]
    async fn test_with_sync_degrades_when_board_down() {
        let (registry, board) = registry();
        board.put(board_item(1, "Ready"));
        let a = registry.create(create_input(1, "claude-0")).unwrap();
        registry.ensure_board_item_id(a.assignment_id).await.unwrap();

        board.set_failing(true);
        let updated = registry
            .update_status_with_sync(a.assignment_id, AssignmentStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(updated.status, AssignmentStatus::InProgress);
        board.set_failing(false);
        assert_eq!(board.snapshot("ITEM_1").unwrap().status, "Ready");
    }

    #[test]
    fn test_work_sessions_append_and_end() {
        let (registry, _) = registry();
        let a = registry.create(create_input(1, "claude-0")).unwrap();
        registry
            .append_work_session(a.assignment_id, "do the work".to_string())
            .unwrap();
        registry
            .end_last_session(a.assignment_id, Some("exited 0".to_string()))
            .unwrap();
        let a = registry.get(a.assignment_id).unwrap();
        assert_eq!(a.work_sessions.len(), 1);
        assert!(a.work_sessions[0].ended_at.is_some());
        assert_eq!(a.work_sessions[0].summary.as_deref(), Some("exited 0"));
    }

    #[test]
    fn test_remove_clears_all_indices() {
        let (registry, _) = registry();
        let a = registry.create(create_input(42, "claude-0")).unwrap();
        registry.remove(a.assignment_id).unwrap();
        assert!(registry.get(a.assignment_id).is_none());
        assert!(registry.get_by_issue(42).is_none());
        assert!(registry.get_by_instance(&"claude-0".parse().unwrap()).is_none());
        // The instance and issue are reusable afterwards.
        registry.create(create_input(42, "claude-0")).unwrap();
    }

    #[tokio::test]
    async fn test_ensure_board_item_id_caches() {
        let (registry, board) = registry();
        board.put(board_item(42, "Ready"));
        let a = registry.create(create_input(42, "claude-0")).unwrap();
        let id = registry.ensure_board_item_id(a.assignment_id).await.unwrap();
        assert_eq!(id.as_deref(), Some("ITEM_42"));
        // A second call answers from the cache even if the board is down.
        board.set_failing(true);
        let id = registry.ensure_board_item_id(a.assignment_id).await.unwrap();
        assert_eq!(id.as_deref(), Some("ITEM_42"));
    }

    #[tokio::test]
    async fn test_load_with_conflict_detection_board_wins() {
        let (registry, board) = registry();
        board.put(board_item(42, "Ready"));
        let a = registry.create(create_input(42, "claude-0")).unwrap();
        registry.ensure_board_item_id(a.assignment_id).await.unwrap();
        registry
            .update_status(a.assignment_id, AssignmentStatus::InProgress)
            .unwrap();

        board.set_status("ITEM_42", "Dev Complete").await.unwrap();
        let refreshed = registry.load_with_conflict_detection(42).await.unwrap();
        assert_eq!(refreshed.status, AssignmentStatus::DevComplete);
    }

    #[tokio::test]
    async fn test_load_with_conflict_detection_opaque_status_left_alone() {
        let (registry, board) = registry();
        board.put(board_item(42, "Ready"));
        let a = registry.create(create_input(42, "claude-0")).unwrap();
        registry.ensure_board_item_id(a.assignment_id).await.unwrap();
        registry
            .update_status(a.assignment_id, AssignmentStatus::InProgress)
            .unwrap();

        board.set_status("ITEM_42", "Needs More Info").await.unwrap();
        let refreshed = registry.load_with_conflict_detection(42).await.unwrap();
        assert_eq!(refreshed.status, AssignmentStatus::InProgress);
    }
}
