//! The in-memory key/value map (§4.1).
//!
//! Each live key maps to `(value, last_applied_req_id)`. Writes are only
//! accepted if their `req_id` strictly exceeds the id already stored for
//! that key; this is the sole defense against out-of-order replica
//! delivery, so every mutating entry point funnels through [`HashTable::set`]
//! or [`HashTable::delete`].

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Vec<u8>,
    pub req_id: i64,
}

/// Concurrent key/value map with per-key idempotent writes.
///
/// A `DashMap` gives us the "equivalent concurrent map" the spec allows in
/// place of a single mutex, while still performing the compare-and-swap
/// against `req_id` atomically per key via `DashMap::entry`.
#[derive(Debug, Default)]
pub struct HashTable {
    entries: DashMap<String, Entry>,
}

impl HashTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Stores `(value, req_id)` if `req_id` exceeds the id already stored
    /// for `key` (or the key is absent). Returns `true` if the entry changed.
    pub fn set(&self, key: &str, value: Vec<u8>, req_id: i64) -> bool {
        use dashmap::mapref::entry::Entry as MapEntry;

        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(slot) => {
                slot.insert(Entry { value, req_id });
                true
            }
            MapEntry::Occupied(mut slot) => {
                if req_id > slot.get().req_id {
                    slot.insert(Entry { value, req_id });
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Returns the stored `(value, req_id)` for `key`, or
    /// [`crate::Error::NonExistentKey`] if it is absent.
    pub fn get(&self, key: &str) -> crate::Result<(Vec<u8>, i64)> {
        self.entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.req_id))
            .ok_or(crate::Error::NonExistentKey)
    }

    /// Removes `key` if `req_id` exceeds the stored id, or the key is
    /// absent. Returns `true` if an entry was removed.
    pub fn delete(&self, key: &str, req_id: i64) -> bool {
        use dashmap::mapref::entry::Entry as MapEntry;

        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(_) => false,
            MapEntry::Occupied(slot) => {
                if req_id > slot.get().req_id {
                    slot.remove();
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every live `(key, value, req_id)` triple, used by tests
    /// to compare a replayed table against a live one (§8, property 4).
    pub fn snapshot(&self) -> Vec<(String, Vec<u8>, i64)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().value.clone(), e.value().req_id))
            .collect()
    }
}
