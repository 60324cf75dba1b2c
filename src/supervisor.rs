//! Per-item lifecycle supervision.
//!
//! One supervisor owns one assignment end to end: acquire a slot, create
//! the assignment, ensure the working tree, build the prompt, launch the
//! worker in its PTY, poll for completion, classify the log, and either
//! finalize, resurrect once, or fail. A supervisor's errors terminate only
//! its own assignment.

use crate::board::{Board, BoardItem};
use crate::config::Config;
use crate::epic::is_phase_master;
use crate::errors::SupervisorError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::process::{ProcessSupervisor, StartSpec};
use crate::prompts::{self, PromptContext, PromptKind, kind_for_item};
use crate::providers::{InstanceId, Provider};
use crate::registry::{
    AssignmentMetadata, AssignmentRegistry, AssignmentStatus, CreateAssignment,
};
use crate::signals::{self, Verdict};
use crate::slots::InstanceSlotAllocator;
use crate::worktree::WorktreeProvider;
use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const MONITOR_POLL: Duration = Duration::from_secs(5);

/// Shared services a supervisor borrows from the orchestrator.
#[derive(Clone)]
pub struct SupervisorContext {
    pub config: Arc<Config>,
    pub registry: Arc<AssignmentRegistry>,
    pub board: Arc<dyn Board>,
    pub process: Arc<ProcessSupervisor>,
    pub worktrees: Arc<WorktreeProvider>,
    pub slots: Arc<InstanceSlotAllocator>,
    pub events: EventBus,
}

/// Releases the slot on every exit path.
struct SlotGuard {
    slots: Arc<InstanceSlotAllocator>,
    instance_id: InstanceId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Err(e) = self.slots.release(&self.instance_id) {
            error!(instance = %self.instance_id, error = %e, "slot release failed");
        }
    }
}

pub struct ItemLifecycleSupervisor {
    ctx: SupervisorContext,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl ItemLifecycleSupervisor {
    pub fn new(ctx: SupervisorContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            poll_interval: MONITOR_POLL,
        }
    }

    /// Tighten the monitor poll (tests).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Drive `item` to a terminal state. `sibling_branches` is non-empty
    /// only for phase masters and lists the work-item branches to merge.
    pub async fn run(
        &self,
        item: BoardItem,
        provider: Provider,
        sibling_branches: Vec<String>,
    ) -> Result<(), SupervisorError> {
        let Some(instance_id) = self.ctx.slots.acquire(provider) else {
            return Err(SupervisorError::NoSlotAvailable { provider });
        };
        let _slot = SlotGuard {
            slots: Arc::clone(&self.ctx.slots),
            instance_id: instance_id.clone(),
        };

        let issue_number = item.issue_number;
        let result = self.drive(item, instance_id.clone(), sibling_branches).await;

        if let Err(e) = &result {
            error!(issue = issue_number, error = %e, "supervisor failed");
            if let Some(assignment) = self.ctx.registry.get_by_issue(issue_number)
                && assignment.instance_id == instance_id
            {
                let _ = self
                    .ctx
                    .registry
                    .end_last_session(assignment.assignment_id, Some(e.to_string()));
                self.finalize(
                    assignment.assignment_id,
                    AssignmentStatus::Failed,
                    Some(e.to_string()),
                )
                .await;
            }
        }
        self.ctx.process.reap(&instance_id);
        result
    }

    async fn drive(
        &self,
        item: BoardItem,
        instance_id: InstanceId,
        sibling_branches: Vec<String>,
    ) -> Result<(), SupervisorError> {
        let config = &self.ctx.config;
        let branch_name = config.branch_for(item.issue_number);
        let metadata = AssignmentMetadata {
            is_phase_master: is_phase_master(&item),
            ..Default::default()
        };

        let assignment = self.ctx.registry.create(CreateAssignment {
            issue_number: item.issue_number,
            instance_id: instance_id.clone(),
            provider: instance_id.provider,
            worktree_path: config.worktree_path_for(item.issue_number),
            branch_name: branch_name.clone(),
            board_item_id: Some(item.board_item_id.clone()),
            metadata,
        })?;
        let id = assignment.assignment_id;
        self.ctx.registry.ensure_board_item_id(id).await?;

        // Git work runs off the async threads.
        let (worktree_path, base_branch) = {
            let worktrees = Arc::clone(&self.ctx.worktrees);
            let branch = branch_name.clone();
            let path = config.worktree_path_for(item.issue_number);
            tokio::task::spawn_blocking(move || -> Result<(PathBuf, String), SupervisorError> {
                let base = worktrees.default_branch()?;
                let path = worktrees.ensure(&branch, &path, &base)?;
                Ok((path, base))
            })
            .await
            .context("worktree task panicked")??
        };

        let mut kind = kind_for_item(&item);
        let mut previous_summary: Option<String> = None;

        loop {
            let prompt = prompts::build(
                kind,
                &PromptContext {
                    issue_number: item.issue_number,
                    issue_title: &item.title,
                    issue_body: &item.body,
                    branch_name: &branch_name,
                    worktree_path: &worktree_path,
                    base_branch: &base_branch,
                    requires_tests: metadata.requires_tests,
                    requires_ci: metadata.requires_ci,
                    auto_merge: config.auto_merge,
                    previous_summary: previous_summary.as_deref(),
                    sibling_branches: &sibling_branches,
                },
            );
            std::fs::write(config.prompt_path_for(&instance_id), &prompt)
                .context("failed to write prompt file")?;

            let (command, args) = config.worker_command(instance_id.provider);
            let log_path = config.log_path_for(&instance_id);
            self.ctx
                .process
                .start(
                    StartSpec {
                        command,
                        args,
                        prompt: prompt.clone(),
                        cwd: worktree_path.clone(),
                        log_path: log_path.clone(),
                        instance_id: instance_id.clone(),
                        assignment_id: id,
                        env: vec![(
                            instance_id.provider.instance_env_var().to_string(),
                            instance_id.to_string(),
                        )],
                    },
                    None,
                )
                .await?;

            self.ctx
                .registry
                .update_status_with_sync(id, AssignmentStatus::InProgress)
                .await?;
            if let Err(e) = self
                .ctx
                .board
                .set_assigned_instance(&item.board_item_id, Some(&instance_id.to_string()))
                .await
            {
                warn!(issue = item.issue_number, error = %e, "instance write failed, continuing");
            }
            self.ctx.registry.append_work_session(id, prompt)?;
            self.ctx.events.emit(OrchestratorEvent::SupervisorStarted {
                assignment_id: id,
                issue_number: item.issue_number,
                instance_id: instance_id.clone(),
            });
            self.ctx.events.emit(OrchestratorEvent::StatusChanged {
                assignment_id: id,
                issue_number: item.issue_number,
                status: AssignmentStatus::InProgress,
                reason: None,
            });
            info!(
                issue = item.issue_number,
                instance = %instance_id,
                kind = ?kind,
                "worker session started"
            );

            let cancelled = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break true,
                    _ = tokio::time::sleep(self.poll_interval) => {
                        if !self.ctx.process.is_running(&instance_id) {
                            break false;
                        }
                        self.ctx.registry.touch_activity(id);
                    }
                }
            };

            if cancelled {
                info!(issue = item.issue_number, "cancelled, stopping worker");
                if let Err(e) = self.ctx.process.stop(&instance_id).await {
                    warn!(instance = %instance_id, error = %e, "stop failed during cancellation");
                }
                self.ctx
                    .registry
                    .end_last_session(id, Some("cancelled during shutdown".to_string()))?;
                // Status stays as last observed; reconciliation re-aligns.
                return Ok(());
            }

            // Workers can exit milliseconds after writing their signal;
            // classify from a log read taken strictly after the exit.
            let exit_code = self.ctx.process.exit_code(&instance_id).unwrap_or(-1);
            let parsed = signals::parse_log_file(&log_path).unwrap_or_default();
            self.ctx.process.reap(&instance_id);

            match parsed.verdict() {
                Verdict::Failed(reason) => {
                    self.ctx
                        .registry
                        .end_last_session(id, Some(format!("failed: {reason}")))?;
                    self.finalize(id, AssignmentStatus::Failed, Some(reason)).await;
                    return Ok(());
                }
                Verdict::Blocked(reason) => {
                    self.ctx
                        .registry
                        .end_last_session(id, Some(format!("blocked: {reason}")))?;
                    self.finalize(id, AssignmentStatus::Blocked, Some(reason)).await;
                    return Ok(());
                }
                Verdict::Complete => {
                    if let Some(pr) = parsed.effective_pr() {
                        self.ctx.registry.set_pr(id, pr, None)?;
                    }
                    self.ctx.registry.end_last_session(
                        id,
                        Some(format!("completed with exit code {exit_code}")),
                    )?;
                    self.finalize(id, AssignmentStatus::DevComplete, None).await;
                    return Ok(());
                }
                Verdict::NoSignal => {
                    if metadata.is_phase_master && parsed.likely_complete() {
                        // Masters predate the signal contract; a PR-creation
                        // phrase in the log is accepted as completion.
                        if let Some(pr) = parsed.effective_pr() {
                            self.ctx.registry.set_pr(id, pr, None)?;
                        }
                        self.ctx.registry.end_last_session(
                            id,
                            Some("likely complete: pull request observed".to_string()),
                        )?;
                        self.finalize(id, AssignmentStatus::DevComplete, None).await;
                        return Ok(());
                    }

                    let sessions = self
                        .ctx
                        .registry
                        .get(id)
                        .map(|a| a.work_sessions.len())
                        .unwrap_or(0);
                    if sessions <= 1 {
                        warn!(
                            issue = item.issue_number,
                            exit_code, "worker exited without a signal, resurrecting once"
                        );
                        self.ctx.registry.end_last_session(
                            id,
                            Some(format!(
                                "exited with code {exit_code} without a completion signal"
                            )),
                        )?;
                        previous_summary = Some(format!(
                            "The previous session exited with code {exit_code} without \
                             reporting completion."
                        ));
                        kind = PromptKind::Continuation;
                        continue;
                    }

                    self.ctx
                        .registry
                        .end_last_session(id, Some("exited without completion".to_string()))?;
                    self.finalize(
                        id,
                        AssignmentStatus::Failed,
                        Some("process exited without completion".to_string()),
                    )
                    .await;
                    return Ok(());
                }
            }
        }
    }

    /// Apply a terminal transition unless reconciliation already settled
    /// the assignment from the board side, in which case the transition is
    /// abandoned rather than retried.
    async fn finalize(&self, id: Uuid, target: AssignmentStatus, reason: Option<String>) {
        let Some(current) = self.ctx.registry.get(id) else {
            warn!(assignment_id = %id, "assignment removed before finalize");
            return;
        };

        if !current.status.is_live() {
            warn!(
                assignment_id = %id,
                settled = %current.status,
                abandoned = %target,
                "board already settled this assignment, abandoning transition"
            );
            self.ctx.events.emit(OrchestratorEvent::AssignmentFinished {
                assignment_id: id,
                issue_number: current.issue_number,
                status: current.status,
                pr_number: current.pr_number,
            });
            return;
        }

        match self.ctx.registry.update_status_with_sync(id, target).await {
            Ok(updated) => {
                info!(
                    issue = updated.issue_number,
                    status = %updated.status,
                    pr = updated.pr_number,
                    reason = reason.as_deref().unwrap_or(""),
                    "assignment finalized"
                );
                self.ctx.events.emit(OrchestratorEvent::AssignmentFinished {
                    assignment_id: id,
                    issue_number: updated.issue_number,
                    status: updated.status,
                    pr_number: updated.pr_number,
                });
            }
            Err(e) => {
                error!(assignment_id = %id, error = %e, "finalize transition rejected");
            }
        }
    }
}
