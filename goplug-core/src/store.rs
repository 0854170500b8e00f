//! Thread-safe store of live plugin handles
//!
//! Keyed by canonical path. Lookup by declared name falls back to a linear
//! scan; stores hold at most a few hundred entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{PluginHostError, Result};
use crate::handle::PluginHandle;

/// What the store needs to know about an entry
pub trait StoreItem: Send + Sync {
    fn key(&self) -> &Path;
    fn name(&self) -> &str;
}

impl StoreItem for PluginHandle {
    fn key(&self) -> &Path {
        PluginHandle::key(self)
    }

    fn name(&self) -> &str {
        PluginHandle::name(self)
    }
}

pub struct PluginStore<H: StoreItem = PluginHandle> {
    entries: RwLock<HashMap<PathBuf, Arc<H>>>,
}

impl<H: StoreItem> Default for PluginStore<H> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<H: StoreItem> PluginStore<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under the item's key.
    ///
    /// Without `force` an occupied key fails with `DUPLICATE`; with it the old
    /// entry is replaced and handed back.
    pub fn put(&self, item: Arc<H>, force: bool) -> Result<Option<Arc<H>>> {
        let key = item.key().to_path_buf();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !force && entries.contains_key(&key) {
            return Err(PluginHostError::Duplicate {
                key: key.display().to_string(),
            });
        }
        Ok(entries.insert(key, item))
    }

    /// Look up by key, then by declared name
    pub fn get(&self, key: &str) -> Result<Arc<H>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(item) = entries.get(Path::new(key)) {
            return Ok(Arc::clone(item));
        }
        entries
            .values()
            .find(|item| item.name() == key)
            .cloned()
            .ok_or_else(|| PluginHostError::not_found(key))
    }

    pub fn get_path(&self, path: &Path) -> Option<Arc<H>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Every entry, ordered by key
    pub fn get_all(&self) -> Vec<Arc<H>> {
        let mut all: Vec<Arc<H>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.key().cmp(b.key()));
        all
    }

    pub fn remove(&self, key: &Path) -> Result<Arc<H>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .ok_or_else(|| PluginHostError::not_found(key.display().to_string()))
    }

    pub fn size(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Every entry is stored under its own key
    pub fn is_valid(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|(key, item)| key == item.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Entry {
        key: PathBuf,
        name: String,
    }

    impl StoreItem for Entry {
        fn key(&self) -> &Path {
            &self.key
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn entry(key: &str, name: &str) -> Arc<Entry> {
        Arc::new(Entry {
            key: PathBuf::from(key),
            name: name.to_string(),
        })
    }

    #[test]
    fn test_put_refuses_duplicates_without_force() {
        let store = PluginStore::new();
        store.put(entry("/p/a.so", "a"), false).unwrap();
        let err = store.put(entry("/p/a.so", "a2"), false).unwrap_err();
        assert!(matches!(err, PluginHostError::Duplicate { .. }));
        assert_eq!(store.get("/p/a.so").unwrap().name, "a");

        let old = store.put(entry("/p/a.so", "a2"), true).unwrap();
        assert_eq!(old.map(|o| o.name.clone()), Some("a".to_string()));
        assert_eq!(store.get("/p/a.so").unwrap().name, "a2");
    }

    #[test]
    fn test_size_counts_distinct_keys() {
        let store = PluginStore::new();
        let keys = ["/p/a", "/p/b", "/p/a", "/p/c", "/p/b"];
        for (i, key) in keys.iter().enumerate() {
            store.put(entry(key, &format!("n{i}")), true).unwrap();
        }
        assert_eq!(store.size(), 3);
        assert!(store.is_valid());
    }

    #[test]
    fn test_get_falls_back_to_name() {
        let store = PluginStore::new();
        store.put(entry("/p/goplug-hello.so", "hello"), false).unwrap();
        assert_eq!(store.get("hello").unwrap().key, PathBuf::from("/p/goplug-hello.so"));
        assert!(matches!(
            store.get("missing").unwrap_err(),
            PluginHostError::NotFound { .. }
        ));
    }

    #[test]
    fn test_remove_then_get_is_not_found() {
        let store = PluginStore::new();
        store.put(entry("/p/x", "x"), false).unwrap();
        store.remove(Path::new("/p/x")).unwrap();
        assert!(store.get("x").is_err());
        assert!(store.remove(Path::new("/p/x")).is_err());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_get_all_is_sorted() {
        let store = PluginStore::new();
        store.put(entry("/p/b", "b"), false).unwrap();
        store.put(entry("/p/a", "a"), false).unwrap();
        let names: Vec<_> = store.get_all().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
