use std::path::PathBuf;

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};

use super::Database;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Slot holding `classroomId -> endTimestamp` for every open attendance window.
pub const WINDOWS_KEY: &str = "attendance_windows";
/// Slot holding `classroomId -> punch state`.
pub const PUNCH_STATUSES_KEY: &str = "punch_statuses";

/// Best-effort typed slots on top of the key/value table.
///
/// Reads never fail: a missing or unparsable slot yields the caller's default.
/// Writes never fail either; problems are logged and dropped. The two slots are
/// written independently, so a crash between writes can leave them out of step.
#[derive(Clone)]
pub struct LocalStore {
    db: Database,
}

impl LocalStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            db: Database::new(path)?,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::in_memory()?,
        })
    }

    pub async fn load<T>(&self, key: &str, default: T) -> T
    where
        T: DeserializeOwned,
    {
        let raw = match self.db.get_value(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return default,
            Err(err) => {
                log_warn!("Failed to read slot {key}: {err:#}");
                return default;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                log_warn!("Discarding corrupt slot {key}: {err}");
                default
            }
        }
    }

    pub async fn save<T>(&self, key: &str, value: &T)
    where
        T: Serialize + ?Sized,
    {
        let serialized = match serde_json::to_string(value) {
            Ok(serialized) => serialized,
            Err(err) => {
                log_warn!("Failed to serialize slot {key}: {err}");
                return;
            }
        };

        match self.db.put_value(key, serialized).await {
            Ok(()) => log_debug!("Persisted slot {key}"),
            Err(err) => log_warn!("Failed to persist slot {key}: {err:#}"),
        }
    }

    /// Writes raw text into a slot, bypassing serialization.
    #[cfg(test)]
    pub(crate) async fn save_raw(&self, key: &str, raw: &str) {
        if let Err(err) = self.db.put_value(key, raw.to_string()).await {
            log_warn!("Failed to persist slot {key}: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[tokio::test]
    async fn missing_slot_returns_default() {
        let store = LocalStore::in_memory().unwrap();
        let windows: BTreeMap<String, i64> = store.load(WINDOWS_KEY, BTreeMap::new()).await;
        assert!(windows.is_empty());
    }

    #[tokio::test]
    async fn corrupt_slot_returns_default() {
        let store = LocalStore::in_memory().unwrap();
        store.save_raw(WINDOWS_KEY, "{not json").await;

        let mut fallback = BTreeMap::new();
        fallback.insert("fallback".to_string(), 1_i64);
        let windows = store.load(WINDOWS_KEY, fallback.clone()).await;
        assert_eq!(windows, fallback);
    }

    #[tokio::test]
    async fn slots_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite3");

        let mut windows = BTreeMap::new();
        windows.insert("C1".to_string(), 1_700_000_300_000_i64);

        {
            let store = LocalStore::open(path.clone()).unwrap();
            store.save(WINDOWS_KEY, &windows).await;
        }

        let store = LocalStore::open(path).unwrap();
        let loaded: BTreeMap<String, i64> = store.load(WINDOWS_KEY, BTreeMap::new()).await;
        assert_eq!(loaded, windows);
    }
}
