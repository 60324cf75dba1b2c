//! Status mapping between the registry's tagged variants and the board's
//! named statuses.
//!
//! This table is the only place in the core that compares status strings.
//! Board statuses with no mapping (`Todo`, `Evaluated`, `Needs More Info`,
//! `Blocked`, ...) are preserved opaquely and never overwritten.

use crate::registry::AssignmentStatus;

/// Board statuses meaning "open for assignment".
pub const READY_STATUSES: &[&str] = &["Ready"];

/// Board statuses meaning "development finished".
pub const COMPLETE_STATUSES: &[&str] = &["Done", "Completed", "Dev Complete"];

pub fn is_ready_status(name: &str) -> bool {
    READY_STATUSES.iter().any(|s| *s == name)
}

pub fn is_complete_status(name: &str) -> bool {
    COMPLETE_STATUSES.iter().any(|s| *s == name)
}

/// The fixed bidirectional mapping.
pub struct StatusMapping;

impl StatusMapping {
    /// Canonical board name for a local status, or `None` when the core
    /// never writes that state to the board (`assigned`, `blocked`,
    /// `failed` all stay local; the operator owns those columns).
    pub fn to_board(status: AssignmentStatus) -> Option<&'static str> {
        match status {
            AssignmentStatus::InProgress => Some("In Progress"),
            AssignmentStatus::DevComplete => Some("Dev Complete"),
            AssignmentStatus::Merged => Some("Done"),
            AssignmentStatus::Assigned
            | AssignmentStatus::Blocked
            | AssignmentStatus::Failed => None,
        }
    }

    /// Local status for a board name, or `None` for opaque statuses the
    /// core must leave alone.
    ///
    /// `Blocked` maps on read (the operator blocking an item must reach the
    /// supervisor) even though the core never writes it.
    pub fn to_assignment(name: &str) -> Option<AssignmentStatus> {
        match name {
            "Ready" => Some(AssignmentStatus::Assigned),
            "In Progress" => Some(AssignmentStatus::InProgress),
            // Review happens after development is complete; for the core's
            // state machine both mean the dev work is done.
            "Dev Complete" | "In Review" => Some(AssignmentStatus::DevComplete),
            "Done" | "Completed" => Some(AssignmentStatus::Merged),
            "Blocked" => Some(AssignmentStatus::Blocked),
            _ => None,
        }
    }
}
