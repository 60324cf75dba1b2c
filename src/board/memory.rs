//! In-process board implementation.
//!
//! Backs the test suite and the degraded-mode scenarios: `set_failing(true)`
//! makes every call return `BoardError::Unavailable` until cleared, the way
//! an outage would.

use super::{Board, BoardItem, ItemFilter, ItemPage, PAGE_SIZE};
use crate::errors::BoardError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct MemoryBoard {
    items: Mutex<Vec<BoardItem>>,
    failing: AtomicBool,
}

impl MemoryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an item (keyed by `board_item_id`).
    pub fn put(&self, item: BoardItem) {
        let mut items = self.items.lock();
        if let Some(existing) = items
            .iter_mut()
            .find(|i| i.board_item_id == item.board_item_id)
        {
            *existing = item;
        } else {
            items.push(item);
        }
    }

    /// Simulate an outage: every call fails until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Direct snapshot for assertions, bypassing the Board trait.
    pub fn snapshot(&self, board_item_id: &str) -> Option<BoardItem> {
        self.items
            .lock()
            .iter()
            .find(|i| i.board_item_id == board_item_id)
            .cloned()
    }

    pub fn remove(&self, board_item_id: &str) {
        self.items.lock().retain(|i| i.board_item_id != board_item_id);
    }

    fn check_available(&self) -> Result<(), BoardError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BoardError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Board for MemoryBoard {
    async fn list_items(&self, filter: &ItemFilter) -> Result<ItemPage, BoardError> {
        self.check_available()?;
        let items = self.items.lock();
        let start: usize = filter
            .cursor
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let page: Vec<BoardItem> = items.iter().skip(start).take(PAGE_SIZE).cloned().collect();
        let consumed = start + page.len();
        let next_cursor = (consumed < items.len()).then(|| consumed.to_string());
        let mut page = ItemPage { items: page, next_cursor };
        if let Some(wanted) = &filter.statuses {
            page.items.retain(|i| wanted.contains(&i.status));
        }
        Ok(page)
    }

    async fn get_status(&self, board_item_id: &str) -> Result<Option<String>, BoardError> {
        self.check_available()?;
        Ok(self
            .snapshot(board_item_id)
            .map(|i| i.status)
            .filter(|s| !s.is_empty()))
    }

    async fn set_status(&self, board_item_id: &str, status: &str) -> Result<(), BoardError> {
        self.check_available()?;
        let mut items = self.items.lock();
        let item = items
            .iter_mut()
            .find(|i| i.board_item_id == board_item_id)
            .ok_or_else(|| BoardError::ItemNotFound(board_item_id.to_string()))?;
        item.status = status.to_string();
        Ok(())
    }

    async fn get_assigned_instance(
        &self,
        board_item_id: &str,
    ) -> Result<Option<String>, BoardError> {
        self.check_available()?;
        Ok(self.snapshot(board_item_id).and_then(|i| i.assigned_instance))
    }

    async fn set_assigned_instance(
        &self,
        board_item_id: &str,
        instance: Option<&str>,
    ) -> Result<(), BoardError> {
        self.check_available()?;
        let mut items = self.items.lock();
        let item = items
            .iter_mut()
            .find(|i| i.board_item_id == board_item_id)
            .ok_or_else(|| BoardError::ItemNotFound(board_item_id.to_string()))?;
        item.assigned_instance = instance.map(str::to_string);
        Ok(())
    }

    async fn get_item_for_issue(&self, issue_number: u64) -> Result<Option<String>, BoardError> {
        self.check_available()?;
        Ok(self
            .items
            .lock()
            .iter()
            .find(|i| i.issue_number == issue_number)
            .map(|i| i.board_item_id.clone()))
    }
}
