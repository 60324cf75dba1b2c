//! Phased epic coordination.
//!
//! Items in an epic are grouped into phases by the `Phase N` / `Phase N.M`
//! designator in their titles (or `Phase` field). Each phase may carry one
//! master item (title contains the token `MASTER`, designator never `N.M`)
//! that integrates its siblings' branches; a master only becomes assignable
//! once every work item in its phase is done and merged, and the next
//! phase opens only once the master itself has merged.

use crate::board::{BoardItem, is_complete_status};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::warn;

static PHASE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bphase\s+(\d+)(?:\.(\d+))?").unwrap());

/// `Phase N` (a whole phase, where masters live) or `Phase N.M` (one work
/// item within phase N).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseDesignator {
    Whole(u32),
    Sub(u32, u32),
}

impl PhaseDesignator {
    pub fn parse(text: &str) -> Option<Self> {
        let cap = PHASE_REGEX.captures(text)?;
        let phase: u32 = cap.get(1)?.as_str().parse().ok()?;
        match cap.get(2) {
            Some(sub) => Some(Self::Sub(phase, sub.as_str().parse().ok()?)),
            None => Some(Self::Whole(phase)),
        }
    }

    pub fn phase(&self) -> u32 {
        match self {
            Self::Whole(n) | Self::Sub(n, _) => *n,
        }
    }

    pub fn is_sub(&self) -> bool {
        matches!(self, Self::Sub(..))
    }
}

/// Phase number for an item: title designator first, then the `Phase`
/// custom field, defaulting to phase 0.
pub fn phase_of(item: &BoardItem) -> u32 {
    if let Some(designator) = PhaseDesignator::parse(&item.title) {
        return designator.phase();
    }
    if let Some(field) = item.field("Phase") {
        if let Some(designator) = PhaseDesignator::parse(field) {
            return designator.phase();
        }
        if let Ok(n) = field.trim().parse::<u32>() {
            return n;
        }
    }
    0
}

/// A master carries the `MASTER` token and never a sub-designator; it
/// integrates rather than implements.
pub fn is_phase_master(item: &BoardItem) -> bool {
    let has_token = item
        .title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == "MASTER");
    if !has_token {
        return false;
    }
    match PhaseDesignator::parse(&item.title) {
        Some(designator) => !designator.is_sub(),
        None => true,
    }
}

/// How the coordinator asks about the world beyond the items themselves.
pub trait PhaseProbe {
    /// Whether the item's PR landed on the default branch (board + repo
    /// checks).
    fn is_pr_merged(&self, item: &BoardItem) -> bool;

    /// Whether the item currently has a worker (board field or live
    /// registry assignment).
    fn is_assigned(&self, item: &BoardItem) -> bool;
}

#[derive(Debug, Clone)]
pub struct PhaseGroup {
    pub number: u32,
    pub master: Option<BoardItem>,
    pub work_items: Vec<BoardItem>,
}

pub struct EpicCoordinator {
    epic_name: String,
}

impl EpicCoordinator {
    pub fn new(epic_name: impl Into<String>) -> Self {
        Self {
            epic_name: epic_name.into(),
        }
    }

    pub fn epic_name(&self) -> &str {
        &self.epic_name
    }

    /// An item belongs to the epic when its `Epic` field matches the name
    /// or its title contains it.
    pub fn is_member(&self, item: &BoardItem) -> bool {
        if item.epic().map(str::trim) == Some(self.epic_name.as_str()) {
            return true;
        }
        item.title
            .to_lowercase()
            .contains(&self.epic_name.to_lowercase())
    }

    /// Group the epic's items by phase, electing at most one master per
    /// phase. Duplicate masters keep the lowest issue number; the rest are
    /// demoted to work items and flagged loudly.
    pub fn group_phases(&self, items: &[BoardItem]) -> BTreeMap<u32, PhaseGroup> {
        let mut groups: BTreeMap<u32, PhaseGroup> = BTreeMap::new();
        for item in items.iter().filter(|i| self.is_member(i)) {
            let number = phase_of(item);
            let group = groups.entry(number).or_insert_with(|| PhaseGroup {
                number,
                master: None,
                work_items: Vec::new(),
            });
            if is_phase_master(item) {
                match &group.master {
                    None => group.master = Some(item.clone()),
                    Some(existing) if item.issue_number < existing.issue_number => {
                        warn!(
                            phase = number,
                            kept = item.issue_number,
                            demoted = existing.issue_number,
                            "duplicate phase masters, keeping lowest issue number"
                        );
                        let demoted = group.master.replace(item.clone()).unwrap();
                        group.work_items.push(demoted);
                    }
                    Some(existing) => {
                        warn!(
                            phase = number,
                            kept = existing.issue_number,
                            demoted = item.issue_number,
                            "duplicate phase masters, keeping lowest issue number"
                        );
                        group.work_items.push(item.clone());
                    }
                }
            } else {
                group.work_items.push(item.clone());
            }
        }
        groups
    }

    /// The items assignable right now, respecting phase sequencing:
    /// - work items of the lowest non-complete phase, while any are open;
    /// - then that phase's master, once every work item is done and merged;
    /// - nothing while the master is assigned or awaiting its own merge;
    /// - nothing once every phase is complete.
    pub fn assignable(&self, items: &[BoardItem], probe: &dyn PhaseProbe) -> Vec<BoardItem> {
        let groups = self.group_phases(items);
        for group in groups.values() {
            if phase_fully_complete(group, probe) {
                continue;
            }

            if let Some(master) = &group.master
                && probe.is_assigned(master)
            {
                // Hold the line until the master finishes.
                return Vec::new();
            }

            if work_items_complete(group, probe) {
                match &group.master {
                    Some(master) if !is_complete_status(&master.status) => {
                        return vec![master.clone()];
                    }
                    // Master done on the board but its PR not merged yet, or
                    // no master at all while a work-item PR is pending.
                    _ => return Vec::new(),
                }
            }

            return group
                .work_items
                .iter()
                .filter(|item| !is_complete_status(&item.status) && !probe.is_assigned(item))
                .cloned()
                .collect();
        }
        Vec::new()
    }
}

/// Every non-master work item is in the completion set with a merged PR.
/// An empty work-item list counts as complete (master-only phases).
fn work_items_complete(group: &PhaseGroup, probe: &dyn PhaseProbe) -> bool {
    group
        .work_items
        .iter()
        .all(|item| is_complete_status(&item.status) && probe.is_pr_merged(item))
}

/// The whole phase is finished: all work merged and the master (when one
/// exists) merged to the default branch.
fn phase_fully_complete(group: &PhaseGroup, probe: &dyn PhaseProbe) -> bool {
    if !work_items_complete(group, probe) {
        return false;
    }
    match &group.master {
        Some(master) => is_complete_status(&master.status) && probe.is_pr_merged(master),
        None => true,
    }
}
