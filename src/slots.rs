//! Fixed-capacity instance slot pool.
//!
//! For provider `p` with capacity `N`, the slot ids are `p-0` .. `p-(N-1)`.
//! The allocator is the sole issuer of instance ids; double-issue and
//! double-release are invariant violations.

use crate::errors::RegistryError;
use crate::providers::{InstanceId, Provider};
use crate::registry::Assignment;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

pub struct InstanceSlotAllocator {
    pools: Mutex<HashMap<Provider, Vec<bool>>>,
}

impl InstanceSlotAllocator {
    pub fn new(capacities: &HashMap<Provider, usize>) -> Self {
        let pools = capacities
            .iter()
            .map(|(provider, capacity)| (*provider, vec![false; *capacity]))
            .collect();
        Self {
            pools: Mutex::new(pools),
        }
    }

    /// Hand out the lowest free slot for `provider`, or `None` when the
    /// pool is exhausted. Exhaustion is not an error — the item simply
    /// stays a pending candidate for the next tick.
    pub fn acquire(&self, provider: Provider) -> Option<InstanceId> {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(&provider)?;
        let slot = pool.iter().position(|in_use| !in_use)?;
        pool[slot] = true;
        let id = InstanceId::new(provider, slot);
        debug!(instance = %id, "slot acquired");
        Some(id)
    }

    pub fn release(&self, id: &InstanceId) -> Result<(), RegistryError> {
        let mut pools = self.pools.lock();
        let slot = pools
            .get_mut(&id.provider)
            .and_then(|pool| pool.get_mut(id.slot))
            .ok_or_else(|| {
                RegistryError::InvariantViolation(format!("unknown slot released: {id}"))
            })?;
        if !*slot {
            return Err(RegistryError::InvariantViolation(format!(
                "slot released twice: {id}"
            )));
        }
        *slot = false;
        debug!(instance = %id, "slot released");
        Ok(())
    }

    pub fn free(&self, provider: Provider) -> usize {
        self.pools
            .lock()
            .get(&provider)
            .map(|pool| pool.iter().filter(|in_use| !**in_use).count())
            .unwrap_or(0)
    }

    pub fn in_use(&self, provider: Provider) -> usize {
        self.pools
            .lock()
            .get(&provider)
            .map(|pool| pool.iter().filter(|in_use| **in_use).count())
            .unwrap_or(0)
    }

    /// Free slots across all providers; bounds how many new supervisors the
    /// orchestrator may spawn this tick.
    pub fn total_free(&self) -> usize {
        self.pools
            .lock()
            .values()
            .map(|pool| pool.iter().filter(|in_use| !**in_use).count())
            .sum()
    }

    /// Re-derive the in-use set from live assignments. Called once at
    /// startup so a restarted orchestrator honors commitments it adopted
    /// from the board.
    pub fn rebuild_from(&self, assignments: &[Assignment]) {
        let mut pools = self.pools.lock();
        for pool in pools.values_mut() {
            pool.fill(false);
        }
        for assignment in assignments {
            if !assignment.status.is_live() {
                continue;
            }
            let id = &assignment.instance_id;
            match pools.get_mut(&id.provider).and_then(|p| p.get_mut(id.slot)) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => warn!(instance = %id, "duplicate live instance during rebuild"),
                None => warn!(
                    instance = %id,
                    "live assignment references a slot outside configured capacity"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AssignmentMetadata, CreateAssignment};
    use std::path::PathBuf;

    fn allocator(claude: usize, gemini: usize) -> InstanceSlotAllocator {
        let mut capacities = HashMap::new();
        capacities.insert(Provider::Claude, claude);
        capacities.insert(Provider::Gemini, gemini);
        InstanceSlotAllocator::new(&capacities)
    }

    #[test]
    fn test_acquire_hands_out_lowest_slot_first() {
        let slots = allocator(2, 1);
        assert_eq!(slots.acquire(Provider::Claude).unwrap().to_string(), "claude-0");
        assert_eq!(slots.acquire(Provider::Claude).unwrap().to_string(), "claude-1");
    }

    #[test]
    fn test_exhausted_pool_returns_none() {
        let slots = allocator(1, 0);
        assert!(slots.acquire(Provider::Claude).is_some());
        assert!(slots.acquire(Provider::Claude).is_none());
        assert!(slots.acquire(Provider::Gemini).is_none());
        // A provider with no configured pool at all also yields none.
        assert!(slots.acquire(Provider::Codex).is_none());
    }

    #[test]
    fn test_release_recycles_slot() {
        let slots = allocator(1, 0);
        let id = slots.acquire(Provider::Claude).unwrap();
        slots.release(&id).unwrap();
        assert_eq!(slots.acquire(Provider::Claude).unwrap(), id);
    }

    #[test]
    fn test_no_duplicate_issue_under_contention() {
        let slots = std::sync::Arc::new(allocator(4, 0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let slots = std::sync::Arc::clone(&slots);
            handles.push(std::thread::spawn(move || slots.acquire(Provider::Claude)));
        }
        let issued: Vec<InstanceId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(issued.len(), 4);
        let unique: std::collections::HashSet<_> = issued.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_double_release_is_invariant_violation() {
        let slots = allocator(1, 0);
        let id = slots.acquire(Provider::Claude).unwrap();
        slots.release(&id).unwrap();
        assert!(matches!(
            slots.release(&id),
            Err(RegistryError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_release_unknown_slot_is_invariant_violation() {
        let slots = allocator(1, 0);
        let id: InstanceId = "claude-7".parse().unwrap();
        assert!(matches!(
            slots.release(&id),
            Err(RegistryError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_counters() {
        let slots = allocator(2, 1);
        assert_eq!(slots.total_free(), 3);
        let _a = slots.acquire(Provider::Claude).unwrap();
        assert_eq!(slots.free(Provider::Claude), 1);
        assert_eq!(slots.in_use(Provider::Claude), 1);
        assert_eq!(slots.total_free(), 2);
    }

    fn live_assignment(issue: u64, instance: &str) -> crate::registry::Assignment {
        let board = std::sync::Arc::new(crate::board::MemoryBoard::new());
        let registry = crate::registry::AssignmentRegistry::new(board);
        registry
            .create(CreateAssignment {
                issue_number: issue,
                instance_id: instance.parse().unwrap(),
                provider: instance.parse::<InstanceId>().unwrap().provider,
                worktree_path: PathBuf::from("/tmp/t"),
                branch_name: "b".to_string(),
                board_item_id: None,
                metadata: AssignmentMetadata::default(),
            })
            .unwrap()
    }

    #[test]
    fn test_rebuild_from_marks_live_assignments() {
        let slots = allocator(2, 1);
        let assignments = vec![live_assignment(1, "claude-1"), live_assignment(2, "gemini-0")];
        slots.rebuild_from(&assignments);
        assert_eq!(slots.in_use(Provider::Claude), 1);
        assert_eq!(slots.in_use(Provider::Gemini), 1);
        // claude-0 is still free; claude-1 is not reissued.
        assert_eq!(slots.acquire(Provider::Claude).unwrap().to_string(), "claude-0");
        assert!(slots.acquire(Provider::Claude).is_none());
    }
}
