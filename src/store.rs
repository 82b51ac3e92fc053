//! Lazy, deduplicating registry mapping `build_id/suffix` keys to readers.
//! The factory is injected at construction so the store stays decoupled
//! from whatever concretely produces a reader (an `HttpObjectSource`, a
//! `Retrier`-wrapped one, an in-memory stand-in for tests).

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::Result;
use crate::read_at::ReadAt;

type Factory = Box<dyn Fn(&str) -> Result<Arc<dyn ReadAt>> + Send + Sync>;

pub struct Store {
    factory: Factory,
    readers: DashMap<String, Arc<dyn ReadAt>>,
}

impl Store {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn ReadAt>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            readers: DashMap::new(),
        }
    }

    /// Returns the reader for `key`, creating it via the factory on first
    /// access. Two concurrent lookups for the same key that race into the
    /// vacant-entry branch still produce a single reader: `DashMap`'s
    /// per-shard lock is held across the whole entry match.
    pub fn get(&self, key: &str) -> Result<Arc<dyn ReadAt>> {
        match self.readers.entry(key.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let reader = (self.factory)(key)?;
                e.insert(reader.clone());
                Ok(reader)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_source::MemObjectSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_key_returns_identical_reader_and_creates_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let store = Store::new(move |_key| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MemObjectSource::new(vec![1, 2, 3])) as Arc<dyn ReadAt>)
        });

        let a = store.get("build-1/memfile").unwrap();
        let b = store.get("build-1/memfile").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_keys_create_distinct_readers() {
        let store = Store::new(|_key| Ok(Arc::new(MemObjectSource::new(vec![0])) as Arc<dyn ReadAt>));
        let a = store.get("build-1/memfile").unwrap();
        let b = store.get("build-2/memfile").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 2);
    }
}
