use std::collections::HashMap;

use super::state::Direction;

type LockKey = (Direction, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub request_id: String,
    pub expires_at_ms: i64,
}

/// Single-flight guard per `(direction, classroom)`. Every grant carries an
/// expiry so a confirmation that never arrives cannot block the pair forever.
#[derive(Debug, Default)]
pub struct LockTable {
    grants: HashMap<LockKey, LockGrant>,
}

impl LockTable {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, direction: Direction, classroom_id: &str, now_ms: i64) -> bool {
        self.grants
            .get(&(direction, classroom_id.to_string()))
            .is_some_and(|grant| grant.expires_at_ms > now_ms)
    }

    /// Grants the lock unless a live grant exists. A stale grant is replaced.
    pub fn try_acquire(
        &mut self,
        direction: Direction,
        classroom_id: &str,
        request_id: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> bool {
        if self.is_held(direction, classroom_id, now_ms) {
            return false;
        }
        self.grants.insert(
            (direction, classroom_id.to_string()),
            LockGrant {
                request_id: request_id.to_string(),
                expires_at_ms: now_ms.saturating_add(ttl_ms),
            },
        );
        true
    }

    pub fn release(&mut self, direction: Direction, classroom_id: &str) -> Option<LockGrant> {
        self.grants.remove(&(direction, classroom_id.to_string()))
    }

    /// Releases the grant only if it still belongs to `request_id`.
    pub fn release_if(&mut self, direction: Direction, classroom_id: &str, request_id: &str) -> bool {
        let key = (direction, classroom_id.to_string());
        match self.grants.get(&key) {
            Some(grant) if grant.request_id == request_id => {
                self.grants.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn release_classroom(&mut self, classroom_id: &str) {
        self.grants.retain(|(_, id), _| id != classroom_id);
    }

    /// Removes and returns every grant whose deadline has passed.
    pub fn take_expired(&mut self, now_ms: i64) -> Vec<(Direction, String, LockGrant)> {
        let expired: Vec<LockKey> = self
            .grants
            .iter()
            .filter(|(_, grant)| grant.expires_at_ms <= now_ms)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                self.grants
                    .remove(&key)
                    .map(|grant| (key.0, key.1, grant))
            })
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
