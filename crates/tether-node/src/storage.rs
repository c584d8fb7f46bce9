//! Object storage: the local key → (owner, value) table.
//!
//! Several entries may share a key as long as their owners differ. Lookups
//! are linear scans under a single mutex.

use crate::object::DistributedObject;
use std::fmt;
use std::sync::{Arc, Mutex};
use tether_types::{Contact, Id, TetherError, TetherResult};

/// One stored object and the node that owns it.
#[derive(Clone)]
pub struct LiveEntry {
    pub key: Id,
    pub owner: Contact,
    pub value: Option<Arc<dyn DistributedObject>>,
}

impl LiveEntry {
    pub fn new(key: Id, owner: Contact, value: Option<Arc<dyn DistributedObject>>) -> Self {
        Self { key, owner, value }
    }

    /// The stored object, or `ObjectVanished` for a null entry.
    pub fn object(&self) -> TetherResult<Arc<dyn DistributedObject>> {
        self.value
            .clone()
            .ok_or_else(|| TetherError::ObjectVanished(self.key.to_string()))
    }
}

impl fmt::Debug for LiveEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveEntry")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("value", &self.value.as_ref().map(|v| v.name().to_string()))
            .finish()
    }
}

#[derive(Default)]
pub struct ObjectStorage {
    entries: Mutex<Vec<LiveEntry>>,
}

impl ObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry stored under `key`, in insertion order.
    pub fn find(&self, key: &Id) -> Vec<LiveEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().filter(|e| e.key == *key).cloned().collect()
    }

    /// Entries under `key` owned by `owner`.
    pub fn find_owned_by(&self, key: &Id, owner: &Contact) -> Vec<LiveEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| e.key == *key && e.owner == *owner)
            .cloned()
            .collect()
    }

    /// Insert an entry, replacing the one with the same key and owner.
    pub fn put(&self, entry: LiveEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries
            .iter_mut()
            .find(|e| e.key == entry.key && e.owner == entry.owner)
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    /// Replace every entry under the entry's key with this one.
    pub fn update_or_put(&self, entry: LiveEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|e| e.key != entry.key);
        entries.push(entry);
    }

    /// Remove every entry under `key`, returning how many were removed.
    pub fn remove(&self, key: &Id) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.key != *key);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::testing::counter;

    fn contact(port: u16) -> Contact {
        Contact::new([127, 0, 0, 1].into(), port)
    }

    fn entry(name: &str, owner: u16, count: i64) -> LiveEntry {
        let object: Arc<dyn DistributedObject> = counter(name, count);
        LiveEntry::new(Id::new_hash(name), contact(owner), Some(object))
    }

    fn count(entry: &LiveEntry) -> i64 {
        entry.object().unwrap().get_direct("count").unwrap().as_i64().unwrap()
    }

    #[test]
    fn test_put_then_find() {
        let storage = ObjectStorage::new();
        storage.put(entry("a", 1, 10));
        let found = storage.find(&Id::new_hash("a"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner, contact(1));
        assert!(storage.find(&Id::new_hash("b")).is_empty());
    }

    #[test]
    fn test_put_replaces_same_owner() {
        let storage = ObjectStorage::new();
        storage.put(entry("a", 1, 10));
        storage.put(entry("a", 1, 20));
        let found = storage.find(&Id::new_hash("a"));
        assert_eq!(found.len(), 1);
        assert_eq!(count(&found[0]), 20);
    }

    #[test]
    fn test_put_keeps_distinct_owners() {
        let storage = ObjectStorage::new();
        storage.put(entry("a", 1, 10));
        storage.put(entry("a", 2, 20));
        assert_eq!(storage.find(&Id::new_hash("a")).len(), 2);
        let owned = storage.find_owned_by(&Id::new_hash("a"), &contact(2));
        assert_eq!(owned.len(), 1);
        assert_eq!(count(&owned[0]), 20);
    }

    #[test]
    fn test_update_or_put_replaces_all_with_key() {
        let storage = ObjectStorage::new();
        storage.put(entry("a", 1, 10));
        storage.put(entry("a", 2, 20));
        storage.put(entry("b", 1, 30));
        storage.update_or_put(entry("a", 3, 40));

        let found = storage.find(&Id::new_hash("a"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner, contact(3));
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_remove_deletes_all_with_key() {
        let storage = ObjectStorage::new();
        storage.put(entry("a", 1, 10));
        storage.put(entry("a", 2, 20));
        storage.put(entry("b", 1, 30));
        assert_eq!(storage.remove(&Id::new_hash("a")), 2);
        assert!(storage.find(&Id::new_hash("a")).is_empty());
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_null_entry_reports_vanished() {
        let storage = ObjectStorage::new();
        storage.put(LiveEntry::new(Id::new_hash("a"), contact(1), None));
        let found = storage.find(&Id::new_hash("a"));
        assert!(matches!(found[0].object(), Err(TetherError::ObjectVanished(_))));
    }
}
