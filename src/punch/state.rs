use serde::{Deserialize, Serialize};

/// Punch progress for one attendance window. Only moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "camelCase")]
pub enum PunchState {
    #[default]
    None,
    In,
    Done,
}

impl PunchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PunchState::None => "none",
            PunchState::In => "in",
            PunchState::Done => "done",
        }
    }

    pub fn can_advance_to(&self, next: PunchState) -> bool {
        next >= *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn target(&self) -> PunchState {
        match self {
            Direction::In => PunchState::In,
            Direction::Out => PunchState::Done,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// An optimistic punch waiting for the server to confirm it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPunch {
    pub direction: Direction,
    pub request_id: String,
    pub issued_at_ms: i64,
}

/// Two-phase view of a classroom's punch status: the last state the server
/// confirmed, plus at most one optimistic step per direction on top of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PunchEntry {
    pub confirmed: PunchState,
    pub pending: Vec<PendingPunch>,
}

impl PunchEntry {
    pub fn restored(state: PunchState) -> Self {
        Self {
            confirmed: state,
            pending: Vec::new(),
        }
    }

    /// What the user should see right now.
    pub fn effective(&self) -> PunchState {
        self.pending
            .iter()
            .map(|pending| pending.direction.target())
            .fold(self.confirmed, PunchState::max)
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_for(&self, direction: Direction) -> Option<&PendingPunch> {
        self.pending
            .iter()
            .find(|pending| pending.direction == direction)
    }

    pub fn holds_request(&self, request_id: &str) -> bool {
        self.pending
            .iter()
            .any(|pending| pending.request_id == request_id)
    }

    pub fn push(&mut self, pending: PendingPunch) {
        self.pending.push(pending);
    }

    /// Server confirmation for `state`. Backward moves are ignored; pending
    /// steps the confirmation covers are settled.
    pub fn confirm(&mut self, state: PunchState) -> bool {
        if !self.confirmed.can_advance_to(state) {
            return false;
        }
        self.confirmed = state;
        self.pending
            .retain(|pending| pending.direction.target() > state);
        true
    }

    /// Drops the step for `request_id` together with any step stacked on top
    /// of it. Returns what was dropped.
    pub fn rollback(&mut self, request_id: &str) -> Vec<PendingPunch> {
        let Some(floor) = self
            .pending
            .iter()
            .find(|pending| pending.request_id == request_id)
            .map(|pending| pending.direction.target())
        else {
            return Vec::new();
        };

        let (dropped, kept) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| pending.direction.target() >= floor);
        self.pending = kept;
        dropped
    }

    pub fn rollback_all(&mut self) -> Vec<PendingPunch> {
        std::mem::take(&mut self.pending)
    }
}
