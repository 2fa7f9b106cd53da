//! The neighborhood action queue scheduler.
//!
//! Actions are claimed in ascending Id order. At most one action per
//! `(ServerId, ActionClass)` pair may be in flight at a time — claiming an
//! action reserves that pair for the reservation window, and a second action
//! against the same pair is skipped until the first is released — and no
//! more than `concurrency` actions are in flight across the whole queue.

use crate::storage::{Storage, StorageError};
use parking_lot::Mutex;
use profile_core::types::{ActionClass, NeighborhoodAction, ServerId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionQueueError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

type Result<T> = std::result::Result<T, ActionQueueError>;

pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Outcome of attempting to execute a claimed action.
pub enum Outcome {
    /// The action completed; remove it from the queue.
    Success,
    /// A transient failure; retry after the configured backoff.
    SoftFailure,
    /// A permanent failure; remove it from the queue without retrying.
    HardFailure,
}

pub struct ActionQueue {
    storage: Arc<Storage>,
    reservations: Mutex<HashMap<(ServerId, ActionClass), Instant>>,
    reservation_ttl: Duration,
    soft_failure_backoff: Duration,
    concurrency: usize,
}

impl ActionQueue {
    pub fn new(
        storage: Arc<Storage>,
        concurrency: usize,
        reservation_ttl: Duration,
        soft_failure_backoff: Duration,
    ) -> Self {
        ActionQueue {
            storage,
            reservations: Mutex::new(HashMap::new()),
            reservation_ttl,
            soft_failure_backoff,
            concurrency,
        }
    }

    pub fn enqueue(&self, action: NeighborhoodAction) -> Result<()> {
        self.storage.put_action(&action)?;
        Ok(())
    }

    /// Claim up to `concurrency` minus already-reserved-in-this-call due
    /// actions, in ascending Id order. A `(ServerId, class)` pair is skipped
    /// once any lower-id row for that pair is not itself claimable right
    /// now — reserved by an in-flight claim, or sitting with a future
    /// `execute_after` from a prior soft failure — since claiming a higher-id
    /// action of the same pair out of order would violate ordering even
    /// though the in-memory reservation for the lower one may have already
    /// been released.
    pub fn claim_due(&self) -> Result<Vec<NeighborhoodAction>> {
        let now = now_millis();
        let mut reservations = self.reservations.lock();
        self.expire_stale_reservations(&mut reservations);

        let budget = self.concurrency.saturating_sub(reservations.len());
        if budget == 0 {
            return Ok(Vec::new());
        }

        let mut blocked: HashSet<(ServerId, ActionClass)> = HashSet::new();
        let mut claimed = Vec::new();
        for action in self.storage.iter_actions() {
            let action = action?;
            if claimed.len() >= budget {
                break;
            }
            let key = (action.server_id, action.class());
            if blocked.contains(&key) {
                continue;
            }
            if reservations.contains_key(&key) {
                blocked.insert(key);
                continue;
            }
            let due = action.execute_after.map(|t| t <= now).unwrap_or(true);
            if !due {
                blocked.insert(key);
                continue;
            }
            reservations.insert(key, Instant::now());
            blocked.insert(key);
            claimed.push(action);
        }
        Ok(claimed)
    }

    fn expire_stale_reservations(&self, reservations: &mut HashMap<(ServerId, ActionClass), Instant>) {
        let ttl = self.reservation_ttl;
        reservations.retain(|_, claimed_at| claimed_at.elapsed() < ttl);
    }

    /// Release a claimed action's reservation and apply its outcome.
    pub fn complete(&self, action: &NeighborhoodAction, outcome: Outcome) -> Result<()> {
        self.reservations.lock().remove(&(action.server_id, action.class()));
        match outcome {
            Outcome::Success | Outcome::HardFailure => {
                self.storage.remove_action(action.id)?;
            }
            Outcome::SoftFailure => {
                let mut retried = action.clone();
                retried.execute_after = Some(now_millis() + self.soft_failure_backoff.as_millis() as u64);
                self.storage.put_action(&retried)?;
            }
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.storage.iter_actions().count()
    }

    /// Drop every queued action against `server_id` except `keep_id`, and
    /// release its reservation. Used when a neighbor is removed: any action
    /// still queued for it other than the RemoveNeighbor action itself is
    /// moot.
    pub fn cancel_all_for_server(&self, server_id: ServerId, keep_id: u64) -> Result<usize> {
        let mut removed = 0;
        let pending: Vec<NeighborhoodAction> =
            self.storage.iter_actions().filter_map(|r| r.ok()).filter(|a| a.server_id == server_id).collect();
        for action in pending {
            if action.id == keep_id {
                continue;
            }
            self.reservations.lock().remove(&(action.server_id, action.class()));
            self.storage.remove_action(action.id)?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profile_core::types::ActionType;
    use tempfile::tempdir;

    fn make_action(id: u64, server_id: [u8; 32], action_type: ActionType, execute_after: Option<u64>) -> NeighborhoodAction {
        NeighborhoodAction {
            id,
            server_id: ServerId(server_id),
            action_type,
            target_identity_id: None,
            execute_after,
            timestamp: 0,
            additional_data: String::new(),
        }
    }

    #[test]
    fn claims_due_actions_in_id_order() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let queue = ActionQueue::new(storage.clone(), 5, Duration::from_secs(600), Duration::from_secs(600));

        queue.enqueue(make_action(2, [1; 32], ActionType::RefreshProfiles, None)).unwrap();
        queue.enqueue(make_action(1, [1; 32], ActionType::RefreshProfiles, None)).unwrap();

        // Same ServerId+class: only the lowest Id is claimable at once.
        let claimed = queue.claim_due().unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, 1);
    }

    #[test]
    fn respects_concurrency_cap_across_servers() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let queue = ActionQueue::new(storage.clone(), 1, Duration::from_secs(600), Duration::from_secs(600));

        queue.enqueue(make_action(1, [1; 32], ActionType::RefreshProfiles, None)).unwrap();
        queue.enqueue(make_action(2, [2; 32], ActionType::RefreshProfiles, None)).unwrap();

        let claimed = queue.claim_due().unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn not_yet_due_actions_are_skipped() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let queue = ActionQueue::new(storage.clone(), 5, Duration::from_secs(600), Duration::from_secs(600));

        queue
            .enqueue(make_action(1, [1; 32], ActionType::RefreshProfiles, Some(now_millis() + 1_000_000)))
            .unwrap();

        assert!(queue.claim_due().unwrap().is_empty());
    }

    #[test]
    fn soft_failure_reschedules_with_backoff() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let backoff = Duration::from_secs(600);
        let queue = ActionQueue::new(storage.clone(), 5, Duration::from_secs(600), backoff);

        let action = make_action(1, [1; 32], ActionType::RefreshProfiles, None);
        queue.enqueue(action.clone()).unwrap();
        let claimed = queue.claim_due().unwrap();
        queue.complete(&claimed[0], Outcome::SoftFailure).unwrap();

        let retried = storage.get_action(1).unwrap().unwrap();
        assert!(retried.execute_after.unwrap() >= now_millis() + backoff.as_millis() as u64 - 1000);
    }

    #[test]
    fn soft_failure_blocks_higher_id_same_key_until_retry_is_due() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let backoff = Duration::from_secs(600);
        let queue = ActionQueue::new(storage.clone(), 5, Duration::from_secs(600), backoff);

        queue.enqueue(make_action(1, [1; 32], ActionType::RefreshProfiles, None)).unwrap();
        let claimed = queue.claim_due().unwrap();
        assert_eq!(claimed.len(), 1);
        queue.complete(&claimed[0], Outcome::SoftFailure).unwrap();

        // Action 1 is retried with a future execute_after and its in-memory
        // reservation is released by complete(). A higher-id action against
        // the same (ServerId, class) pair must still not be claimable.
        queue.enqueue(make_action(2, [1; 32], ActionType::RefreshProfiles, None)).unwrap();
        assert_eq!(queue.claim_due().unwrap().len(), 0);
    }

    #[test]
    fn success_removes_action_and_releases_reservation() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let queue = ActionQueue::new(storage.clone(), 5, Duration::from_secs(600), Duration::from_secs(600));

        let action = make_action(1, [1; 32], ActionType::RefreshProfiles, None);
        queue.enqueue(action.clone()).unwrap();
        let claimed = queue.claim_due().unwrap();
        queue.complete(&claimed[0], Outcome::Success).unwrap();

        assert!(storage.get_action(1).unwrap().is_none());
        assert_eq!(queue.claim_due().unwrap().len(), 0);
    }
}
