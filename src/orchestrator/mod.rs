//! Top-level orchestration loop.
//!
//! Startup reconciles the registry against the board and adopts the
//! commitments a previous run left behind; the loop then ticks every few
//! seconds — reap finished supervisors, pick ready candidates bounded by
//! free slots (restricted by the epic coordinator when an epic is named),
//! spawn one supervisor per candidate, and reconcile periodically. Shutdown
//! cancels every supervisor, waits for all of them, and prunes worktrees.

use crate::board::{BoardItem, ItemFilter, StatusMapping, list_all_items};
use crate::epic::{EpicCoordinator, PhaseProbe, is_phase_master, phase_of};
use crate::errors::SupervisorError;
use crate::evaluator::Evaluator;
use crate::events::OrchestratorEvent;
use crate::providers::{InstanceId, Provider};
use crate::registry::{
    AssignmentMetadata, AssignmentStatus, CreateAssignment, sync_all_fields_from_board,
};
use crate::supervisor::{ItemLifecycleSupervisor, SupervisorContext};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Orchestrator {
    ctx: SupervisorContext,
    evaluator: Arc<dyn Evaluator>,
    epic: Option<EpicCoordinator>,
    cancel: CancellationToken,
    /// Live supervisor tasks, keyed by issue number. Lifetime equals the
    /// orchestrator's; this is deliberately not a process global.
    running: HashMap<u64, JoinHandle<Result<(), SupervisorError>>>,
    last_reconcile: Instant,
}

impl Orchestrator {
    pub fn new(ctx: SupervisorContext, evaluator: Arc<dyn Evaluator>) -> Self {
        let epic = ctx.config.epic.clone().map(EpicCoordinator::new);
        Self {
            ctx,
            evaluator,
            epic,
            cancel: CancellationToken::new(),
            running: HashMap::new(),
            last_reconcile: Instant::now(),
        }
    }

    /// Token a signal handler cancels to begin a graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Initial reconciliation plus slot-pool rebuild.
    pub async fn startup(&mut self) {
        let outcome =
            sync_all_fields_from_board(&self.ctx.registry, self.ctx.board.as_ref()).await;
        self.ctx.events.emit(OrchestratorEvent::ReconcileCompleted {
            report: outcome.report,
        });

        self.adopt_board_commitments().await;
        self.ctx.slots.rebuild_from(&self.ctx.registry.list());
        self.last_reconcile = Instant::now();
        info!(
            live = self.ctx.registry.len(),
            free_slots = self.ctx.slots.total_free(),
            "orchestrator started"
        );
    }

    /// Rebuild the ephemeral registry from the board: any item already
    /// carrying an instance id and an in-progress status was committed by a
    /// previous run, and its slot must not be reissued. No supervisor is
    /// attached; the operator or reconciliation resolves these.
    async fn adopt_board_commitments(&self) {
        let items = match list_all_items(self.ctx.board.as_ref(), ItemFilter::default()).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "cannot adopt board commitments, board unavailable");
                return;
            }
        };

        for item in items {
            let Some(raw_instance) = &item.assigned_instance else {
                continue;
            };
            if StatusMapping::to_assignment(&item.status) != Some(AssignmentStatus::InProgress) {
                continue;
            }
            let Ok(instance_id) = raw_instance.parse::<InstanceId>() else {
                warn!(
                    issue = item.issue_number,
                    instance = %raw_instance,
                    "unparseable instance id on board, skipping adoption"
                );
                continue;
            };
            if self.ctx.registry.get_by_issue(item.issue_number).is_some() {
                continue;
            }

            let created = self.ctx.registry.create(CreateAssignment {
                issue_number: item.issue_number,
                instance_id: instance_id.clone(),
                provider: instance_id.provider,
                worktree_path: self.ctx.config.worktree_path_for(item.issue_number),
                branch_name: self.ctx.config.branch_for(item.issue_number),
                board_item_id: Some(item.board_item_id.clone()),
                metadata: AssignmentMetadata {
                    is_phase_master: is_phase_master(&item),
                    ..Default::default()
                },
            });
            match created {
                Ok(assignment) => {
                    let _ = self
                        .ctx
                        .registry
                        .update_status(assignment.assignment_id, AssignmentStatus::InProgress);
                    warn!(
                        issue = item.issue_number,
                        instance = %instance_id,
                        "adopted in-progress commitment from board; no worker attached"
                    );
                }
                Err(e) => {
                    error!(issue = item.issue_number, error = %e, "failed to adopt commitment");
                }
            }
        }
    }

    /// One scheduler pass: reap finished supervisors, then spawn new ones
    /// up to the free-slot bound.
    pub async fn tick_once(&mut self) {
        self.reap_finished().await;
        let free = self.ctx.slots.total_free();
        if free > 0 {
            self.spawn_candidates(free).await;
        }
    }

    pub async fn reconcile_now(&mut self) {
        let outcome =
            sync_all_fields_from_board(&self.ctx.registry, self.ctx.board.as_ref()).await;
        for removed in &outcome.removed {
            // Reconciliation removed the assignment; free its slot unless a
            // supervisor still owns it (its guard releases on exit). A
            // terminal assignment's slot was already released.
            if removed.status.is_live() && !self.running.contains_key(&removed.issue_number) {
                let _ = self.ctx.slots.release(&removed.instance_id);
            }
        }
        self.ctx.events.emit(OrchestratorEvent::ReconcileCompleted {
            report: outcome.report,
        });
        self.last_reconcile = Instant::now();
    }

    /// Run until the cancellation token fires, then drain.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.startup().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.config.tick()) => {}
            }
            self.tick_once().await;
            if self.last_reconcile.elapsed() >= self.ctx.config.reconcile_interval() {
                self.reconcile_now().await;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<u64> = self
            .running
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(issue, _)| *issue)
            .collect();
        for issue in finished {
            let Some(handle) = self.running.remove(&issue) else {
                continue;
            };
            match handle.await {
                Ok(Ok(())) => debug!(issue, "supervisor finished"),
                Ok(Err(e)) => warn!(issue, error = %e, "supervisor ended with error"),
                Err(e) => error!(issue, error = %e, "supervisor task panicked"),
            }
        }
    }

    async fn spawn_candidates(&mut self, free: usize) {
        let candidates = match self.evaluator.pick_ready_items(free).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "candidate pick skipped, board unavailable");
                return;
            }
        };
        if candidates.is_empty() {
            return;
        }

        let (candidates, siblings_by_issue) = match &self.epic {
            Some(epic) => match self.restrict_to_epic(epic, candidates).await {
                Some(restricted) => restricted,
                None => return,
            },
            None => (candidates, HashMap::new()),
        };

        for item in candidates {
            if self.ctx.slots.total_free() == 0 {
                break;
            }
            if self.running.contains_key(&item.issue_number)
                || self.ctx.registry.get_by_issue(item.issue_number).is_some()
            {
                continue;
            }
            let Some(provider) = self.pick_provider() else {
                break;
            };

            let siblings = siblings_by_issue
                .get(&item.issue_number)
                .cloned()
                .unwrap_or_default();
            let supervisor =
                ItemLifecycleSupervisor::new(self.ctx.clone(), self.cancel.child_token());
            let issue = item.issue_number;
            info!(issue, provider = %provider, "spawning supervisor");
            let handle =
                tokio::spawn(async move { supervisor.run(item, provider, siblings).await });
            self.running.insert(issue, handle);
        }
    }

    /// Apply the epic coordinator's assignability rule to the candidate
    /// list, and precompute sibling branches for any assignable master.
    async fn restrict_to_epic(
        &self,
        epic: &EpicCoordinator,
        candidates: Vec<BoardItem>,
    ) -> Option<(Vec<BoardItem>, HashMap<u64, Vec<String>>)> {
        let all_items =
            match list_all_items(self.ctx.board.as_ref(), ItemFilter::default()).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(error = %e, "epic restriction skipped, board unavailable");
                    return None;
                }
            };

        let probe = OrchestratorProbe {
            ctx: &self.ctx,
            default_branch: self.ctx.worktrees.default_branch().ok(),
        };
        let assignable = epic.assignable(&all_items, &probe);
        let allowed: HashSet<u64> = assignable.iter().map(|i| i.issue_number).collect();

        let mut siblings_by_issue = HashMap::new();
        let groups = epic.group_phases(&all_items);
        for item in &assignable {
            if !is_phase_master(item) {
                continue;
            }
            if let Some(group) = groups.get(&phase_of(item)) {
                let branches: Vec<String> = group
                    .work_items
                    .iter()
                    .map(|work| self.ctx.config.branch_for(work.issue_number))
                    .collect();
                siblings_by_issue.insert(item.issue_number, branches);
            }
        }

        let restricted: Vec<BoardItem> = candidates
            .into_iter()
            .filter(|item| allowed.contains(&item.issue_number))
            .collect();
        Some((restricted, siblings_by_issue))
    }

    /// The configured default provider when it has a free slot, otherwise
    /// any provider with capacity.
    fn pick_provider(&self) -> Option<Provider> {
        let default = self.ctx.config.default_provider();
        if self.ctx.slots.free(default) > 0 {
            return Some(default);
        }
        Provider::ALL
            .into_iter()
            .find(|p| self.ctx.slots.free(*p) > 0)
    }

    pub async fn shutdown(&mut self) {
        info!(supervisors = self.running.len(), "shutting down");
        self.cancel.cancel();
        let (issues, handles): (Vec<u64>, Vec<_>) = self.running.drain().unzip();
        for (issue, joined) in issues.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(issue, error = %e, "supervisor ended with error"),
                Err(e) => error!(issue, error = %e, "supervisor task panicked"),
            }
        }
        let worktrees = Arc::clone(&self.ctx.worktrees);
        if let Ok(Err(e)) = tokio::task::spawn_blocking(move || worktrees.prune()).await {
            warn!(error = %e, "worktree prune failed during shutdown");
        }
        info!("shutdown complete");
    }
}

/// Answers the epic coordinator's questions from the registry and the
/// local repository.
struct OrchestratorProbe<'a> {
    ctx: &'a SupervisorContext,
    default_branch: Option<String>,
}

impl PhaseProbe for OrchestratorProbe<'_> {
    fn is_pr_merged(&self, item: &BoardItem) -> bool {
        let Some(default_branch) = &self.default_branch else {
            return false;
        };
        let branch = self.ctx.config.branch_for(item.issue_number);
        self.ctx
            .worktrees
            .branch_merged_into(&branch, default_branch)
            .unwrap_or(false)
    }

    fn is_assigned(&self, item: &BoardItem) -> bool {
        if item.assigned_instance.is_some() {
            return true;
        }
        self.ctx
            .registry
            .get_by_issue(item.issue_number)
            .is_some_and(|a| a.status.is_live())
    }
}
