use std::{cmp, collections::BTreeMap};

use serde::{Deserialize, Serialize};

pub const MS_PER_MINUTE: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceWindow {
    pub classroom_id: String,
    /// Absolute close time in epoch milliseconds. Stored instead of a countdown
    /// so a reloaded process derives the same remaining time.
    pub end_timestamp: i64,
}

impl AttendanceWindow {
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        cmp::max(self.end_timestamp - now_ms, 0)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.end_timestamp <= now_ms
    }
}

/// `classroomId -> endTimestamp` for every open window. This is also the
/// persisted shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowMap {
    ends: BTreeMap<String, i64>,
}

impl WindowMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn end_for(duration_minutes: u32, now_ms: i64) -> i64 {
        now_ms.saturating_add(i64::from(duration_minutes) * MS_PER_MINUTE)
    }

    /// Opens or re-times a window. Returns true when no live window existed,
    /// meaning this is a fresh window rather than an extension of one.
    pub fn open(&mut self, classroom_id: &str, end_timestamp: i64, now_ms: i64) -> bool {
        let fresh = !self.is_open(classroom_id, now_ms);
        self.ends.insert(classroom_id.to_string(), end_timestamp);
        fresh
    }

    pub fn close(&mut self, classroom_id: &str) -> bool {
        self.ends.remove(classroom_id).is_some()
    }

    pub fn is_open(&self, classroom_id: &str, now_ms: i64) -> bool {
        self.ends
            .get(classroom_id)
            .is_some_and(|end| *end > now_ms)
    }

    pub fn get(&self, classroom_id: &str) -> Option<AttendanceWindow> {
        self.ends.get(classroom_id).map(|end| AttendanceWindow {
            classroom_id: classroom_id.to_string(),
            end_timestamp: *end,
        })
    }

    /// Removes and returns every window whose end has been reached.
    pub fn take_expired(&mut self, now_ms: i64) -> Vec<String> {
        let expired: Vec<String> = self
            .ends
            .iter()
            .filter(|(_, end)| **end <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.ends.remove(id);
        }
        expired
    }

    pub fn windows(&self) -> Vec<AttendanceWindow> {
        self.ends
            .iter()
            .map(|(id, end)| AttendanceWindow {
                classroom_id: id.clone(),
                end_timestamp: *end,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }
}
