//! Index implementation

use std::collections::HashMap;

use super::IndexEntry;

/// Key → value location, with live-size accounting
#[derive(Debug, Default)]
pub struct Index {
    entries: HashMap<String, IndexEntry>,

    /// Sum of `entry_len` over live keys
    live_bytes: usize,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Point `key` at a new location, returning the old one
    pub fn insert(&mut self, key: String, entry: IndexEntry) -> Option<IndexEntry> {
        self.live_bytes += entry.entry_len as usize;
        let old = self.entries.insert(key, entry);
        if let Some(old) = &old {
            self.live_bytes -= old.entry_len as usize;
        }
        old
    }

    pub fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        let old = self.entries.remove(key);
        if let Some(old) = &old {
            self.live_bytes -= old.entry_len as usize;
        }
        old
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes a compacted log of the current keys would occupy
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// All keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Entries ordered by log offset (the order a rewrite preserves)
    pub fn entries_by_offset(&self) -> Vec<(&str, &IndexEntry)> {
        let mut entries: Vec<(&str, &IndexEntry)> =
            self.entries.iter().map(|(k, e)| (k.as_str(), e)).collect();
        entries.sort_by_key(|(_, e)| e.offset);
        entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.live_bytes = 0;
    }
}
