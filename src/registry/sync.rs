//! Board reconciliation.
//!
//! Runs on startup and periodically. It is always safe to call: it never
//! creates assignments, it only resolves divergence, with one fixed rule —
//! the board wins for statuses that map to a known local state. Pagination
//! happens before the registry write lock is taken; the merge itself runs
//! under one write-lock acquisition.

use super::{Assignment, AssignmentRegistry, AssignmentStatus};
use crate::board::{Board, ItemFilter, StatusMapping, is_complete_status, is_ready_status,
    list_all_items};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Per-cycle counters, surfaced to the operator after every reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Live assignments checked against the board.
    pub synced: usize,
    /// Assignments whose status the board overrode.
    pub conflicts: usize,
    /// Assignments removed (orphaned on the board, or revoked).
    pub removed: usize,
    /// Board items whose stale Assigned Instance field was cleared.
    pub cleared_stale: usize,
    /// Per-item failures; the rest of the cycle continued.
    pub errors: usize,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "synced={} conflicts={} removed={} cleared_stale={} errors={}",
            self.synced, self.conflicts, self.removed, self.cleared_stale, self.errors
        )
    }
}

/// Result of one reconciliation cycle. `removed` carries the assignments
/// taken out of the registry so the caller can release their slots.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub report: SyncReport,
    pub removed: Vec<Assignment>,
}

struct BoardEntry {
    status: String,
    assigned_instance: Option<String>,
}

/// Fold the remote board into the local registry (spec'd conflict rule:
/// board wins for mapped statuses) and clear stale Assigned Instance slots
/// on the board.
pub async fn sync_all_fields_from_board(
    registry: &AssignmentRegistry,
    board: &dyn Board,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();

    // Phase 1: page through the whole board without holding any lock.
    let items = match list_all_items(board, ItemFilter::default()).await {
        Ok(items) => items,
        Err(e) => {
            error!(error = %e, "reconciliation skipped, board unavailable");
            outcome.report.errors += 1;
            return outcome;
        }
    };

    let mut board_state: HashMap<String, BoardEntry> = HashMap::new();
    let mut stale_candidates: Vec<String> = Vec::new();
    for item in &items {
        if (is_ready_status(&item.status) || is_complete_status(&item.status))
            && item.assigned_instance.is_some()
        {
            stale_candidates.push(item.board_item_id.clone());
        }
        board_state.insert(
            item.board_item_id.clone(),
            BoardEntry {
                status: item.status.clone(),
                assigned_instance: item.assigned_instance.clone(),
            },
        );
    }

    // Phase 2: merge into the registry under one write-lock acquisition.
    // Board writes this phase decides on (write-backs for statuses the
    // outage left behind) are collected and performed after the lock drops.
    let mut write_backs: Vec<(String, AssignmentStatus, bool)> = Vec::new();
    {
        let mut inner = registry.inner.write();
        let ids: Vec<_> = inner.by_id.keys().copied().collect();
        for id in ids {
            let Some(assignment) = inner.by_id.get(&id) else {
                continue;
            };
            let Some(board_item_id) = assignment.board_item_id.clone() else {
                continue;
            };

            let Some(entry) = board_state.get(&board_item_id) else {
                warn!(
                    assignment_id = %id,
                    issue = assignment.issue_number,
                    "board item vanished, removing orphaned assignment"
                );
                if let Some(removed) = remove_locked(&mut inner, id) {
                    outcome.removed.push(removed);
                }
                outcome.report.removed += 1;
                continue;
            };

            let mapped = StatusMapping::to_assignment(&entry.status);

            if assignment.status.is_live() {
                // Only in-progress assignments have had their instance
                // written to the board; an empty field there means the
                // operator revoked the assignment.
                if assignment.status == AssignmentStatus::InProgress
                    && entry.assigned_instance.is_none()
                {
                    warn!(
                        assignment_id = %id,
                        issue = assignment.issue_number,
                        "assigned instance cleared on board, removing assignment"
                    );
                    if let Some(removed) = remove_locked(&mut inner, id) {
                        outcome.removed.push(removed);
                    }
                    outcome.report.removed += 1;
                    continue;
                }

                outcome.report.synced += 1;
                if let Some(mapped) = mapped
                    && mapped != assignment.status
                {
                    warn!(
                        assignment_id = %id,
                        issue = assignment.issue_number,
                        local = %assignment.status,
                        board = %entry.status,
                        "status conflict, board wins"
                    );
                    let a = inner.by_id.get_mut(&id).unwrap();
                    a.status = mapped;
                    a.note_entered(mapped);
                    outcome.report.conflicts += 1;
                }
            } else {
                // Operator re-queued an unsuccessful item: drop the stale
                // record so the scheduler can pick the issue up again.
                if assignment.status.is_unsuccessful()
                    && mapped == Some(AssignmentStatus::Assigned)
                    && entry.assigned_instance.is_none()
                {
                    warn!(
                        assignment_id = %id,
                        issue = assignment.issue_number,
                        "item re-queued on board, dropping failed assignment"
                    );
                    if let Some(removed) = remove_locked(&mut inner, id) {
                        outcome.removed.push(removed);
                    }
                    outcome.report.removed += 1;
                    continue;
                }

                outcome.report.synced += 1;
                // A done assignment whose board item still reads Ready or
                // In Progress lost its write-through to an outage: push the
                // local status back out.
                if assignment.status.is_done()
                    && matches!(
                        mapped,
                        Some(AssignmentStatus::Assigned) | Some(AssignmentStatus::InProgress)
                    )
                {
                    write_backs.push((
                        board_item_id,
                        assignment.status,
                        entry.assigned_instance.is_some(),
                    ));
                }
            }
        }
    }

    for (board_item_id, status, clear_instance) in write_backs {
        let Some(name) = StatusMapping::to_board(status) else {
            continue;
        };
        debug!(item = %board_item_id, status = name, "writing missed status through");
        if let Err(e) = board.set_status(&board_item_id, name).await {
            error!(item = %board_item_id, error = %e, "missed status write-through failed");
            outcome.report.errors += 1;
            continue;
        }
        if clear_instance {
            if let Err(e) = board.set_assigned_instance(&board_item_id, None).await {
                error!(item = %board_item_id, error = %e, "instance clear failed");
                outcome.report.errors += 1;
            }
        }
    }

    // Phase 3: clear stale slots on the board, item by item.
    for board_item_id in stale_candidates {
        match board.set_assigned_instance(&board_item_id, None).await {
            Ok(()) => outcome.report.cleared_stale += 1,
            Err(e) => {
                error!(item = %board_item_id, error = %e, "failed to clear stale instance");
                outcome.report.errors += 1;
            }
        }
    }

    info!(report = %outcome.report, "reconciliation complete");
    outcome
}

fn remove_locked(inner: &mut super::Inner, id: uuid::Uuid) -> Option<Assignment> {
    let assignment = inner.by_id.remove(&id)?;
    inner.by_issue.remove(&assignment.issue_number);
    inner.by_instance.remove(&assignment.instance_id);
    Some(assignment)
}
