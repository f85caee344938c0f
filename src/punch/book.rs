use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    db::{LocalStore, PUNCH_STATUSES_KEY},
    error::Rejection,
};

use super::{
    locks::LockTable,
    state::{Direction, PendingPunch, PunchEntry, PunchState},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

#[derive(Default)]
struct BookState {
    entries: HashMap<String, PunchEntry>,
    locks: LockTable,
}

impl BookState {
    fn effective_map(&self) -> BTreeMap<String, PunchState> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.effective() != PunchState::None)
            .map(|(id, entry)| (id.clone(), entry.effective()))
            .collect()
    }

    fn confirmed_map(&self) -> BTreeMap<String, PunchState> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.confirmed != PunchState::None)
            .map(|(id, entry)| (id.clone(), entry.confirmed))
            .collect()
    }

    fn release_steps(&mut self, classroom_id: &str, steps: &[PendingPunch]) {
        for step in steps {
            self.locks
                .release_if(step.direction, classroom_id, &step.request_id);
        }
    }
}

/// Punch statuses and in-flight locks for every classroom.
///
/// Shared between the coordinator, which advances statuses, and the window
/// tracker, which wipes them when a window closes. Only server-confirmed
/// statuses reach the local store; optimistic steps die with the process.
#[derive(Clone)]
pub struct PunchBook {
    state: Arc<Mutex<BookState>>,
    store: LocalStore,
}

impl PunchBook {
    pub fn new(store: LocalStore) -> Self {
        Self {
            state: Arc::new(Mutex::new(BookState::default())),
            store,
        }
    }

    /// Reloads persisted statuses. Locks are never persisted.
    pub async fn restore(&self) {
        let saved: BTreeMap<String, PunchState> =
            self.store.load(PUNCH_STATUSES_KEY, BTreeMap::new()).await;
        let mut guard = self.state.lock().await;
        guard.entries = saved
            .into_iter()
            .map(|(id, state)| (id, PunchEntry::restored(state)))
            .collect();
        log_info!("Restored {} punch statuses", guard.entries.len());
    }

    pub async fn status(&self, classroom_id: &str) -> PunchState {
        self.state
            .lock()
            .await
            .entries
            .get(classroom_id)
            .map(PunchEntry::effective)
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) async fn entry(&self, classroom_id: &str) -> Option<PunchEntry> {
        self.state.lock().await.entries.get(classroom_id).cloned()
    }

    pub async fn statuses(&self) -> BTreeMap<String, PunchState> {
        self.state.lock().await.effective_map()
    }

    #[cfg(test)]
    pub(crate) async fn lock_held(
        &self,
        direction: Direction,
        classroom_id: &str,
        now_ms: i64,
    ) -> bool {
        self.state
            .lock()
            .await
            .locks
            .is_held(direction, classroom_id, now_ms)
    }

    /// True while the optimistic step for `request_id` is still outstanding.
    pub async fn is_outstanding(&self, classroom_id: &str, request_id: &str) -> bool {
        self.state
            .lock()
            .await
            .entries
            .get(classroom_id)
            .is_some_and(|entry| entry.holds_request(request_id))
    }

    /// Checks preconditions, takes the lock and applies the optimistic step.
    /// A punch-out may stack on a punch-in the server has not confirmed yet.
    pub async fn begin(
        &self,
        direction: Direction,
        classroom_id: &str,
        now_ms: i64,
        lock_ttl_ms: i64,
    ) -> Result<PendingPunch, Rejection> {
        let mut guard = self.state.lock().await;

        if guard.locks.is_held(direction, classroom_id, now_ms) {
            return Err(Rejection::ActionInFlight);
        }

        let entry = guard.entries.get(classroom_id).cloned().unwrap_or_default();
        if entry.pending_for(direction).is_some() {
            return Err(Rejection::ActionInFlight);
        }
        match (direction, entry.effective()) {
            (Direction::In, PunchState::None) | (Direction::Out, PunchState::In) => {}
            (Direction::In, _) => return Err(Rejection::AlreadyPunchedIn),
            (Direction::Out, _) => return Err(Rejection::NotPunchedIn),
        }

        let pending = PendingPunch {
            direction,
            request_id: Uuid::new_v4().to_string(),
            issued_at_ms: now_ms,
        };
        guard.locks.try_acquire(
            direction,
            classroom_id,
            &pending.request_id,
            now_ms,
            lock_ttl_ms,
        );
        guard
            .entries
            .entry(classroom_id.to_string())
            .or_default()
            .push(pending.clone());

        Ok(pending)
    }

    /// Undoes the optimistic step for `request_id`, and any step stacked on
    /// it, and frees their locks. A step that was already confirmed or
    /// replaced is left alone.
    pub async fn rollback(&self, direction: Direction, classroom_id: &str, request_id: &str) -> bool {
        let mut guard = self.state.lock().await;

        let dropped = guard
            .entries
            .get_mut(classroom_id)
            .map(|entry| entry.rollback(request_id))
            .unwrap_or_default();
        guard.release_steps(classroom_id, &dropped);

        if !guard.locks.release_if(direction, classroom_id, request_id) && dropped.is_empty() {
            log_debug!("Lock for {classroom_id} no longer belongs to request {request_id}");
        }

        drop_empty(&mut guard.entries, classroom_id);
        !dropped.is_empty()
    }

    /// Authoritative server confirmation. Returns false for a backward move,
    /// which is ignored.
    pub async fn confirm(&self, direction: Direction, classroom_id: &str) -> bool {
        let mut guard = self.state.lock().await;
        let target = direction.target();

        let advanced = guard
            .entries
            .entry(classroom_id.to_string())
            .or_default()
            .confirm(target);

        guard.locks.release(direction, classroom_id);
        if target == PunchState::Done {
            guard.locks.release(Direction::In, classroom_id);
        }

        if advanced {
            self.persist(&guard).await;
        } else {
            log_info!(
                "Ignoring punch-{} confirmation for {classroom_id}: status already past it",
                direction.as_str()
            );
        }
        advanced
    }

    /// Rolls back every unconfirmed step and frees its lock.
    pub async fn rollback_all_pending(&self) -> Vec<(String, PendingPunch)> {
        let mut guard = self.state.lock().await;
        let mut rolled_back = Vec::new();

        for (classroom_id, entry) in guard.entries.iter_mut() {
            for pending in entry.rollback_all() {
                rolled_back.push((classroom_id.clone(), pending));
            }
        }
        for (classroom_id, pending) in &rolled_back {
            guard.locks.release(pending.direction, classroom_id);
        }

        guard
            .entries
            .retain(|_, entry| entry.is_pending() || entry.confirmed != PunchState::None);
        rolled_back
    }

    /// Expires stale locks and rolls back the steps they were guarding.
    pub async fn sweep_stale_locks(&self, now_ms: i64) -> Vec<(Direction, String)> {
        let mut guard = self.state.lock().await;
        let expired = guard.locks.take_expired(now_ms);

        let mut swept = Vec::new();
        for (direction, classroom_id, grant) in expired {
            let dropped = guard
                .entries
                .get_mut(&classroom_id)
                .map(|entry| entry.rollback(&grant.request_id))
                .unwrap_or_default();
            guard.release_steps(&classroom_id, &dropped);
            drop_empty(&mut guard.entries, &classroom_id);
            swept.push((direction, classroom_id));
        }
        swept
    }

    /// Forgets everything about a classroom; used when its window closes.
    pub async fn clear(&self, classroom_id: &str) {
        let mut guard = self.state.lock().await;
        let had_entry = guard.entries.remove(classroom_id).is_some();
        guard.locks.release_classroom(classroom_id);
        if had_entry {
            self.persist(&guard).await;
        }
    }

    async fn persist(&self, state: &BookState) {
        self.store
            .save(PUNCH_STATUSES_KEY, &state.confirmed_map())
            .await;
    }
}

fn drop_empty(entries: &mut HashMap<String, PunchEntry>, classroom_id: &str) {
    if entries
        .get(classroom_id)
        .is_some_and(|entry| !entry.is_pending() && entry.confirmed == PunchState::None)
    {
        entries.remove(classroom_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL_MS: i64 = 30_000;

    fn book() -> PunchBook {
        PunchBook::new(LocalStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn punch_out_requires_punch_in() {
        let book = book();
        let err = book.begin(Direction::Out, "C1", 0, TTL_MS).await.unwrap_err();
        assert_eq!(err, Rejection::NotPunchedIn);
        assert_eq!(book.status("C1").await, PunchState::None);
    }

    #[tokio::test]
    async fn second_begin_while_in_flight_is_refused() {
        let book = book();
        book.begin(Direction::In, "C1", 0, TTL_MS).await.unwrap();
        let err = book.begin(Direction::In, "C1", 10, TTL_MS).await.unwrap_err();
        assert_eq!(err, Rejection::ActionInFlight);
    }

    #[tokio::test]
    async fn rollback_restores_previous_status_and_frees_lock() {
        let book = book();
        let pending = book.begin(Direction::In, "C1", 0, TTL_MS).await.unwrap();
        assert_eq!(book.status("C1").await, PunchState::In);

        assert!(book.rollback(Direction::In, "C1", &pending.request_id).await);
        assert_eq!(book.status("C1").await, PunchState::None);
        assert!(!book.lock_held(Direction::In, "C1", 1).await);
    }

    #[tokio::test]
    async fn confirmation_settles_status_and_releases_lock() {
        let book = book();
        book.begin(Direction::In, "C1", 0, TTL_MS).await.unwrap();
        assert!(book.confirm(Direction::In, "C1").await);

        let entry = book.entry("C1").await.unwrap();
        assert_eq!(entry, PunchEntry::restored(PunchState::In));
        assert!(!book.lock_held(Direction::In, "C1", 1).await);
    }

    #[tokio::test]
    async fn stale_lock_sweep_rolls_back_unconfirmed_step() {
        let book = book();
        book.begin(Direction::In, "C1", 0, TTL_MS).await.unwrap();

        assert!(book.sweep_stale_locks(TTL_MS - 1).await.is_empty());
        let swept = book.sweep_stale_locks(TTL_MS).await;
        assert_eq!(swept, vec![(Direction::In, "C1".to_string())]);
        assert_eq!(book.status("C1").await, PunchState::None);

        book.begin(Direction::In, "C1", TTL_MS + 1, TTL_MS).await.unwrap();
    }

    #[tokio::test]
    async fn punch_out_can_follow_an_unconfirmed_punch_in() {
        let book = book();
        book.begin(Direction::In, "C1", 0, TTL_MS).await.unwrap();
        book.begin(Direction::Out, "C1", 10, TTL_MS).await.unwrap();
        assert_eq!(book.status("C1").await, PunchState::Done);

        assert!(book.confirm(Direction::In, "C1").await);
        assert_eq!(book.status("C1").await, PunchState::Done);
        assert!(book.lock_held(Direction::Out, "C1", 20).await);

        assert!(book.confirm(Direction::Out, "C1").await);
        assert_eq!(
            book.entry("C1").await.unwrap(),
            PunchEntry::restored(PunchState::Done)
        );
    }

    #[tokio::test]
    async fn rolling_back_punch_in_drops_the_punch_out_on_top() {
        let book = book();
        let punch_in = book.begin(Direction::In, "C1", 0, TTL_MS).await.unwrap();
        book.begin(Direction::Out, "C1", 10, TTL_MS).await.unwrap();

        assert!(book.rollback(Direction::In, "C1", &punch_in.request_id).await);
        assert_eq!(book.status("C1").await, PunchState::None);
        assert!(!book.lock_held(Direction::Out, "C1", 20).await);
        assert!(book.entry("C1").await.is_none());
    }

    #[tokio::test]
    async fn unconfirmed_steps_are_not_restored() {
        let store = LocalStore::in_memory().unwrap();
        let book = PunchBook::new(store.clone());
        book.confirm(Direction::In, "C1").await;
        book.begin(Direction::Out, "C1", 0, TTL_MS).await.unwrap();
        book.begin(Direction::In, "C2", 0, TTL_MS).await.unwrap();
        assert_eq!(book.status("C2").await, PunchState::In);

        let reloaded = PunchBook::new(store);
        reloaded.restore().await;
        assert_eq!(reloaded.status("C1").await, PunchState::In);
        assert_eq!(reloaded.status("C2").await, PunchState::None);
        assert!(!reloaded.entry("C1").await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn statuses_survive_restore() {
        let store = LocalStore::in_memory().unwrap();
        let book = PunchBook::new(store.clone());
        book.confirm(Direction::In, "C1").await;
        book.confirm(Direction::Out, "C2").await;

        let reloaded = PunchBook::new(store);
        reloaded.restore().await;
        assert_eq!(reloaded.status("C1").await, PunchState::In);
        assert_eq!(reloaded.status("C2").await, PunchState::Done);
    }
}
