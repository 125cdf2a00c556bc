use std::collections::HashMap;

use super::storage::{LocalStore, LAST_READ_KEY};

/// Last-read timestamps per peer, the sole basis for unread counts. Local to
/// the device and never published, so peers cannot observe it as a read
/// receipt.
///
/// Owned by the engine actor; every writer goes through `mark_read`, which
/// only ever advances a value, so the map is monotone per key. Persists on
/// every accepted update. `reload_merge` folds in changes made to the
/// persisted file behind the actor's back under the same monotonicity rule.
pub(crate) struct ReadStateLedger {
    store: LocalStore,
    entries: HashMap<String, u64>,
}

impl ReadStateLedger {
    pub(crate) fn load(store: LocalStore) -> Self {
        let entries = store
            .get(LAST_READ_KEY)
            .and_then(|raw| serde_json::from_str::<HashMap<String, u64>>(&raw).ok())
            .unwrap_or_default();
        Self { store, entries }
    }

    pub(crate) fn get(&self, contact: &str) -> u64 {
        self.entries.get(contact).copied().unwrap_or(0)
    }

    /// Strictly-greater rule: stale and duplicate timestamps are ignored.
    /// Returns true (and persists) when the value advanced.
    pub(crate) fn mark_read(&mut self, contact: &str, timestamp: u64) -> bool {
        if timestamp <= self.get(contact) {
            return false;
        }
        self.entries.insert(contact.to_string(), timestamp);
        self.persist();
        true
    }

    #[allow(dead_code)]
    pub(crate) fn snapshot(&self) -> HashMap<String, u64> {
        self.entries.clone()
    }

    /// Re-read the persisted map and take the per-key max. Returns true if
    /// any entry advanced, i.e. an external writer moved the file forward.
    pub(crate) fn reload_merge(&mut self) -> bool {
        let Some(raw) = self.store.get(LAST_READ_KEY) else {
            return false;
        };
        let Ok(disk) = serde_json::from_str::<HashMap<String, u64>>(&raw) else {
            return false;
        };
        let mut advanced = false;
        for (contact, ts) in disk {
            let cur = self.entries.entry(contact).or_insert(0);
            if ts > *cur {
                *cur = ts;
                advanced = true;
            }
        }
        advanced
    }

    fn persist(&self) {
        if let Ok(json) = serde_json::to_string(&self.entries) {
            self.store.set(LAST_READ_KEY, &json);
        }
    }
}
