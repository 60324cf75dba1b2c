//! Prompt templates for worker CLIs.
//!
//! Pure functions from an assignment's context to the text typed into the
//! worker's PTY. Four kinds: stand-alone issues, phase work items (no PR),
//! phase masters (integrate sibling branches), and the continuation prompt
//! used for the single resurrection. Every variant ends with the fixed
//! completion-signal contract — the sole protocol between worker and core.

use crate::epic::{PhaseDesignator, is_phase_master};
use crate::board::BoardItem;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Stand-alone issue: implement, push, open a PR.
    Initial,
    /// `Phase N.M` item: implement but leave the PR to the phase master.
    WorkItem,
    /// Phase master: merge every sibling branch, then PR.
    PhaseMaster,
    /// Resurrection after an unexpected exit.
    Continuation,
}

/// Derive the prompt kind from an item's title.
pub fn kind_for_item(item: &BoardItem) -> PromptKind {
    if is_phase_master(item) {
        return PromptKind::PhaseMaster;
    }
    match PhaseDesignator::parse(&item.title) {
        Some(designator) if designator.is_sub() => PromptKind::WorkItem,
        _ => PromptKind::Initial,
    }
}

/// Everything a prompt template may reference.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub issue_number: u64,
    pub issue_title: &'a str,
    pub issue_body: &'a str,
    pub branch_name: &'a str,
    pub worktree_path: &'a Path,
    pub base_branch: &'a str,
    pub requires_tests: bool,
    pub requires_ci: bool,
    pub auto_merge: bool,
    /// Summary of the previous session, for continuations.
    pub previous_summary: Option<&'a str>,
    /// Sibling work-item branches, for phase masters.
    pub sibling_branches: &'a [String],
}

/// Build the prompt for one worker session.
pub fn build(kind: PromptKind, ctx: &PromptContext) -> String {
    let mut prompt = String::new();

    match kind {
        PromptKind::Initial => build_initial(&mut prompt, ctx),
        PromptKind::WorkItem => build_work_item(&mut prompt, ctx),
        PromptKind::PhaseMaster => build_phase_master(&mut prompt, ctx),
        PromptKind::Continuation => build_continuation(&mut prompt, ctx),
    }

    prompt.push_str(COMPLETION_CONTRACT);
    prompt
}

fn build_header(prompt: &mut String, ctx: &PromptContext, role: &str) {
    prompt.push_str(&format!(
        "# Issue #{}: {}\n\n{}\n\n",
        ctx.issue_number, ctx.issue_title, role
    ));
    prompt.push_str("## Context\n\n");
    prompt.push_str(&format!(
        "- **Working directory**: {}\n",
        ctx.worktree_path.display()
    ));
    prompt.push_str(&format!("- **Branch**: `{}` (already checked out)\n", ctx.branch_name));
    prompt.push_str(&format!("- **Base branch**: `{}`\n\n", ctx.base_branch));

    if !ctx.issue_body.trim().is_empty() {
        prompt.push_str("## Issue Description\n\n");
        prompt.push_str(ctx.issue_body.trim());
        prompt.push_str("\n\n");
    }
}

fn build_testing_section(prompt: &mut String, ctx: &PromptContext) {
    prompt.push_str("## Verification\n\n");
    if ctx.requires_tests {
        prompt.push_str("- Add or update tests covering your change and run the test suite.\n");
    } else {
        prompt.push_str("- Run the existing test suite to confirm nothing regressed.\n");
    }
    if ctx.requires_ci {
        prompt.push_str("- Push the branch so CI runs, and make sure it passes.\n");
    }
    prompt.push('\n');
}

fn build_initial(prompt: &mut String, ctx: &PromptContext) {
    build_header(
        prompt,
        ctx,
        "You are implementing this issue end to end on a dedicated feature branch.",
    );
    prompt.push_str("## Task\n\n");
    prompt.push_str("1. Implement the issue on the checked-out branch.\n");
    prompt.push_str("2. Commit your work with clear messages.\n");
    build_testing_section(prompt, ctx);
    prompt.push_str(&format!(
        "3. Push the branch and create a pull request against `{}`.\n\n",
        ctx.base_branch
    ));
}

fn build_work_item(prompt: &mut String, ctx: &PromptContext) {
    build_header(
        prompt,
        ctx,
        "You are implementing one work item of a phased epic on a dedicated branch.",
    );
    prompt.push_str("## Task\n\n");
    prompt.push_str("1. Implement the work item on the checked-out branch.\n");
    prompt.push_str("2. Commit your work with clear messages.\n");
    build_testing_section(prompt, ctx);
    prompt.push_str(
        "3. Push the branch, but do NOT create a pull request — the phase master \
         will merge your branch together with its siblings.\n\n",
    );
}

fn build_phase_master(prompt: &mut String, ctx: &PromptContext) {
    build_header(
        prompt,
        ctx,
        "You are the phase master: every work item in this phase is done, and your \
         job is integration, not implementation.",
    );
    prompt.push_str("## Task\n\n");
    if ctx.sibling_branches.is_empty() {
        prompt.push_str("1. Merge every sibling work-item branch of this phase into your branch.\n");
    } else {
        prompt.push_str("1. Merge the following work-item branches into your branch:\n");
        for branch in ctx.sibling_branches {
            prompt.push_str(&format!("   - `{branch}`\n"));
        }
    }
    prompt.push_str("2. Resolve any merge conflicts.\n");
    prompt.push_str("3. Run the full test suite and fix integration breakage.\n");
    prompt.push_str(&format!(
        "4. Push the branch and create a pull request against `{}`.\n",
        ctx.base_branch
    ));
    if ctx.auto_merge {
        prompt.push_str("5. The orchestrator merges the PR once checks pass; do not merge it yourself.\n");
    }
    prompt.push('\n');
}

fn build_continuation(prompt: &mut String, ctx: &PromptContext) {
    build_header(
        prompt,
        ctx,
        "A previous session on this issue ended unexpectedly. You are resuming it.",
    );
    if let Some(summary) = ctx.previous_summary {
        prompt.push_str("## Previous Session\n\n");
        prompt.push_str(summary.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str("## Task\n\n");
    prompt.push_str(
        "1. Inspect the working tree, the branch history, and any uncommitted changes \
         to determine how far the previous session got.\n",
    );
    prompt.push_str("2. Finish the remaining work.\n");
    build_testing_section(prompt, ctx);
}

// The examples are indented: markers only count at the start of a line, so
// a copy of this block echoed back through the PTY can never classify a run.
const COMPLETION_CONTRACT: &str = "\
## Completion Signals

When you reach a terminal state, print the matching marker at the start of \
its own line:

  AUTONOMOUS_SIGNAL:COMPLETE          work finished successfully
  AUTONOMOUS_SIGNAL:PR:<number>       a pull request was created or updated
  AUTONOMOUS_SIGNAL:BLOCKED:<reason>  you cannot proceed without help
  AUTONOMOUS_SIGNAL:FAILED:<reason>   unrecoverable error

Always end with COMPLETE, BLOCKED, or FAILED. Emit PR:<number> in addition \
to COMPLETE whenever a pull request exists.
";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn board_item(title: &str) -> BoardItem {
        BoardItem {
            board_item_id: "ITEM_1".to_string(),
            issue_number: 42,
            title: title.to_string(),
            body: String::new(),
            status: "Ready".to_string(),
            assigned_instance: None,
            field_map: HashMap::new(),
        }
    }

    fn context<'a>(worktree: &'a PathBuf, siblings: &'a [String]) -> PromptContext<'a> {
        PromptContext {
            issue_number: 42,
            issue_title: "Add retry logic",
            issue_body: "The client should retry transient failures.",
            branch_name: "issue-42",
            worktree_path: worktree,
            base_branch: "main",
            requires_tests: true,
            requires_ci: false,
            auto_merge: false,
            previous_summary: None,
            sibling_branches: siblings,
        }
    }

    #[test]
    fn test_kind_for_item() {
        assert_eq!(kind_for_item(&board_item("Add retry logic")), PromptKind::Initial);
        assert_eq!(
            kind_for_item(&board_item("Phase 1.2: wire codec")),
            PromptKind::WorkItem
        );
        assert_eq!(
            kind_for_item(&board_item("Phase 1 MASTER: integrate")),
            PromptKind::PhaseMaster
        );
        assert_eq!(
            kind_for_item(&board_item("Phase 2: schema change")),
            PromptKind::Initial
        );
    }

    #[test]
    fn test_every_kind_carries_the_signal_contract() {
        let worktree = PathBuf::from("/work/widget-issue-42");
        let siblings: Vec<String> = vec![];
        for kind in [
            PromptKind::Initial,
            PromptKind::WorkItem,
            PromptKind::PhaseMaster,
            PromptKind::Continuation,
        ] {
            let prompt = build(kind, &context(&worktree, &siblings));
            assert!(prompt.contains("AUTONOMOUS_SIGNAL:COMPLETE"), "{kind:?}");
            assert!(prompt.contains("AUTONOMOUS_SIGNAL:PR:<number>"), "{kind:?}");
            assert!(prompt.contains("AUTONOMOUS_SIGNAL:BLOCKED:<reason>"), "{kind:?}");
            assert!(prompt.contains("AUTONOMOUS_SIGNAL:FAILED:<reason>"), "{kind:?}");
        }
    }

    #[test]
    fn test_initial_prompt_requests_a_pr() {
        let worktree = PathBuf::from("/work/widget-issue-42");
        let prompt = build(PromptKind::Initial, &context(&worktree, &[]));
        assert!(prompt.contains("create a pull request against `main`"));
        assert!(prompt.contains("Issue #42: Add retry logic"));
        assert!(prompt.contains("/work/widget-issue-42"));
        assert!(prompt.contains("retry transient failures"));
    }

    #[test]
    fn test_work_item_prompt_forbids_pr() {
        let worktree = PathBuf::from("/work/widget-issue-42");
        let prompt = build(PromptKind::WorkItem, &context(&worktree, &[]));
        assert!(prompt.contains("do NOT create a pull request"));
        assert!(prompt.contains("phase master"));
    }

    #[test]
    fn test_phase_master_prompt_lists_sibling_branches() {
        let worktree = PathBuf::from("/work/widget-issue-12");
        let siblings = vec!["issue-10".to_string(), "issue-11".to_string()];
        let prompt = build(PromptKind::PhaseMaster, &context(&worktree, &siblings));
        assert!(prompt.contains("`issue-10`"));
        assert!(prompt.contains("`issue-11`"));
        assert!(prompt.contains("Resolve any merge conflicts"));
        assert!(prompt.contains("create a pull request against `main`"));
    }

    #[test]
    fn test_continuation_prompt_mentions_previous_summary() {
        let worktree = PathBuf::from("/work/widget-issue-42");
        let mut ctx = context(&worktree, &[]);
        ctx.previous_summary = Some("exited after implementing the parser");
        let prompt = build(PromptKind::Continuation, &ctx);
        assert!(prompt.contains("ended unexpectedly"));
        assert!(prompt.contains("exited after implementing the parser"));
        assert!(prompt.contains("Inspect the working tree"));
    }

    #[test]
    fn test_continuation_without_summary_omits_section() {
        let worktree = PathBuf::from("/work/widget-issue-42");
        let prompt = build(PromptKind::Continuation, &context(&worktree, &[]));
        assert!(!prompt.contains("## Previous Session"));
    }

    #[test]
    fn test_requires_flags_shape_verification_section() {
        let worktree = PathBuf::from("/work/widget-issue-42");
        let mut ctx = context(&worktree, &[]);
        ctx.requires_tests = false;
        ctx.requires_ci = true;
        let prompt = build(PromptKind::Initial, &ctx);
        assert!(prompt.contains("confirm nothing regressed"));
        assert!(prompt.contains("so CI runs"));
        assert!(!prompt.contains("Add or update tests"));
    }
}
