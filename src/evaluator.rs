//! Candidate selection seam.
//!
//! Prioritization is an external concern; the orchestrator only consumes an
//! ordered sequence of ready items, bounded by free slots. The default
//! implementation reads the board's Ready column ordered by the Priority
//! field, then issue number.

use crate::board::{Board, BoardItem, ItemFilter, READY_STATUSES, list_all_items};
use crate::errors::BoardError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Up to `limit` items ready for implementation, best first.
    async fn pick_ready_items(&self, limit: usize) -> Result<Vec<BoardItem>, BoardError>;
}

pub struct ReadyQueueEvaluator {
    board: Arc<dyn Board>,
}

impl ReadyQueueEvaluator {
    pub fn new(board: Arc<dyn Board>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Evaluator for ReadyQueueEvaluator {
    async fn pick_ready_items(&self, limit: usize) -> Result<Vec<BoardItem>, BoardError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = ItemFilter::with_statuses(READY_STATUSES.iter().copied());
        let mut items = list_all_items(self.board.as_ref(), filter).await?;
        // Items already claimed by a worker are not candidates.
        items.retain(|item| item.assigned_instance.is_none());
        items.sort_by(|a, b| {
            priority_rank(a.priority())
                .cmp(&priority_rank(b.priority()))
                .then(a.issue_number.cmp(&b.issue_number))
        });
        items.truncate(limit);
        Ok(items)
    }
}

/// `P0` beats `P1` beats `P2`; unknown or missing priorities sort last.
fn priority_rank(priority: Option<&str>) -> u32 {
    let Some(p) = priority else {
        return u32::MAX;
    };
    p.trim()
        .strip_prefix(['P', 'p'])
        .and_then(|rest| rest.parse::<u32>().ok())
        .unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::MemoryBoard;
    use std::collections::HashMap;

    fn item(n: u64, status: &str, priority: Option<&str>, instance: Option<&str>) -> BoardItem {
        let mut field_map = HashMap::new();
        if let Some(p) = priority {
            field_map.insert("Priority".to_string(), p.to_string());
        }
        BoardItem {
            board_item_id: format!("ITEM_{n}"),
            issue_number: n,
            title: format!("Issue {n}"),
            body: String::new(),
            status: status.to_string(),
            assigned_instance: instance.map(str::to_string),
            field_map,
        }
    }

    #[tokio::test]
    async fn test_picks_only_ready_unassigned_items() {
        let board = Arc::new(MemoryBoard::new());
        board.put(item(1, "Ready", None, None));
        board.put(item(2, "In Progress", None, None));
        board.put(item(3, "Ready", None, Some("claude-0")));
        board.put(item(4, "Done", None, None));

        let evaluator = ReadyQueueEvaluator::new(board);
        let picked = evaluator.pick_ready_items(10).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].issue_number, 1);
    }

    #[tokio::test]
    async fn test_orders_by_priority_then_issue_number() {
        let board = Arc::new(MemoryBoard::new());
        board.put(item(5, "Ready", Some("P2"), None));
        board.put(item(6, "Ready", Some("P0"), None));
        board.put(item(7, "Ready", None, None));
        board.put(item(8, "Ready", Some("P0"), None));

        let evaluator = ReadyQueueEvaluator::new(board);
        let picked = evaluator.pick_ready_items(10).await.unwrap();
        let order: Vec<u64> = picked.iter().map(|i| i.issue_number).collect();
        assert_eq!(order, vec![6, 8, 5, 7]);
    }

    #[tokio::test]
    async fn test_respects_limit() {
        let board = Arc::new(MemoryBoard::new());
        for n in 1..=5 {
            board.put(item(n, "Ready", None, None));
        }
        let evaluator = ReadyQueueEvaluator::new(board);
        assert_eq!(evaluator.pick_ready_items(2).await.unwrap().len(), 2);
        assert!(evaluator.pick_ready_items(0).await.unwrap().is_empty());
    }
}
