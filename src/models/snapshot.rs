use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::punch::PunchState;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowView {
    pub classroom_id: String,
    pub ends_at: DateTime<Utc>,
    pub remaining_ms: i64,
}

/// Point-in-time view handed to the presentation layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub windows: Vec<WindowView>,
    pub statuses: BTreeMap<String, PunchState>,
}

impl PresenceSnapshot {
    /// Navigation away should be confirmed while this is true.
    pub fn any_window_open(&self) -> bool {
        !self.windows.is_empty()
    }

    pub fn status_of(&self, classroom_id: &str) -> PunchState {
        self.statuses
            .get(classroom_id)
            .copied()
            .unwrap_or_default()
    }
}
