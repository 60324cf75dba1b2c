//! Remote board adapter.
//!
//! The board (GitHub Projects v2 in production) is the user-visible source of
//! truth for per-item status. The core talks to it through the [`Board`]
//! trait so the orchestrator, registry sync, and tests can share one
//! contract; `GithubBoard` is the production implementation and
//! `MemoryBoard` the in-process one used by the test suite.

mod github;
mod memory;
mod status;

pub use github::{GithubBoard, GithubBoardConfig};
pub use memory::MemoryBoard;
pub use status::{
    COMPLETE_STATUSES, READY_STATUSES, StatusMapping, is_complete_status, is_ready_status,
};

use crate::errors::BoardError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Items are fetched in pages of this size.
pub const PAGE_SIZE: usize = 100;

/// Read-only projection of one board item.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardItem {
    /// Opaque remote handle (a Projects item node id).
    pub board_item_id: String,
    /// External issue number.
    pub issue_number: u64,
    pub title: String,
    pub body: String,
    /// Free-form status name exactly as the board reports it.
    pub status: String,
    /// Contents of the "Assigned Instance" field, if set.
    pub assigned_instance: Option<String>,
    /// Arbitrary custom fields (Epic, Phase, Priority, Size, Sprint, ...).
    pub field_map: HashMap<String, String>,
}

impl BoardItem {
    /// Case-insensitive custom-field lookup.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.field_map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn epic(&self) -> Option<&str> {
        self.field("Epic")
    }

    pub fn priority(&self) -> Option<&str> {
        self.field("Priority")
    }
}

/// Filter for [`Board::list_items`].
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Keep only items whose status name is in this set. `None` keeps all.
    pub statuses: Option<HashSet<String>>,
    /// Resume pagination from a previous page's `next_cursor`.
    pub cursor: Option<String>,
}

impl ItemFilter {
    pub fn with_statuses<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statuses: Some(statuses.into_iter().map(Into::into).collect()),
            cursor: None,
        }
    }

    fn matches(&self, item: &BoardItem) -> bool {
        match &self.statuses {
            Some(wanted) => wanted.contains(&item.status),
            None => true,
        }
    }
}

/// One page of board items.
#[derive(Debug, Clone, Default)]
pub struct ItemPage {
    pub items: Vec<BoardItem>,
    pub next_cursor: Option<String>,
}

/// Remote board operations the core depends on.
///
/// Every call carries the adapter's own deadline (30 s by default for the
/// GitHub implementation); failures surface as [`BoardError`] and never
/// panic or block the orchestrator loop.
#[async_trait]
pub trait Board: Send + Sync {
    async fn list_items(&self, filter: &ItemFilter) -> Result<ItemPage, BoardError>;

    /// Current status name, or `None` when the field is unset.
    async fn get_status(&self, board_item_id: &str) -> Result<Option<String>, BoardError>;

    async fn set_status(&self, board_item_id: &str, status: &str) -> Result<(), BoardError>;

    async fn get_assigned_instance(
        &self,
        board_item_id: &str,
    ) -> Result<Option<String>, BoardError>;

    /// `None` clears the field.
    async fn set_assigned_instance(
        &self,
        board_item_id: &str,
        instance: Option<&str>,
    ) -> Result<(), BoardError>;

    /// The board item id for an issue number, if the issue is on the board.
    async fn get_item_for_issue(&self, issue_number: u64) -> Result<Option<String>, BoardError>;
}

/// Drain every page of `filter` into one vector.
pub async fn list_all_items(
    board: &dyn Board,
    mut filter: ItemFilter,
) -> Result<Vec<BoardItem>, BoardError> {
    let mut all = Vec::new();
    loop {
        let page = board.list_items(&filter).await?;
        all.extend(page.items);
        match page.next_cursor {
            Some(cursor) => filter.cursor = Some(cursor),
            None => return Ok(all),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, status: &str) -> BoardItem {
        BoardItem {
            board_item_id: id.to_string(),
            issue_number: 1,
            title: "t".to_string(),
            body: String::new(),
            status: status.to_string(),
            assigned_instance: None,
            field_map: HashMap::new(),
        }
    }

    #[test]
    fn test_filter_none_matches_everything() {
        let filter = ItemFilter::default();
        assert!(filter.matches(&item("a", "Ready")));
        assert!(filter.matches(&item("b", "Needs More Info")));
    }

    #[test]
    fn test_filter_statuses() {
        let filter = ItemFilter::with_statuses(["Ready", "In Progress"]);
        assert!(filter.matches(&item("a", "Ready")));
        assert!(!filter.matches(&item("b", "Done")));
    }

    #[test]
    fn test_field_lookup_is_case_insensitive() {
        let mut i = item("a", "Ready");
        i.field_map.insert("Epic".to_string(), "Launch".to_string());
        assert_eq!(i.field("epic"), Some("Launch"));
        assert_eq!(i.epic(), Some("Launch"));
        assert_eq!(i.field("Phase"), None);
    }

    #[tokio::test]
    async fn test_list_all_items_drains_pages() {
        let board = MemoryBoard::new();
        for n in 1..=250u64 {
            board.put(BoardItem {
                board_item_id: format!("ITEM_{n}"),
                issue_number: n,
                title: format!("Issue {n}"),
                body: String::new(),
                status: "Ready".to_string(),
                assigned_instance: None,
                field_map: HashMap::new(),
            });
        }
        let all = list_all_items(&board, ItemFilter::default()).await.unwrap();
        assert_eq!(all.len(), 250);
    }
}
