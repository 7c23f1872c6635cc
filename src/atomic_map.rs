use std::hash::Hash;
use std::sync::{Arc, RwLock};
use rustc_hash::FxHashMap;

/// Copy-on-write map for data that is read on every packet but changes rarely (e.g. cluster
///  membership). Readers get a consistent snapshot without holding a lock while they work
///  with it, and updates replace the whole map.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read().unwrap().clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.read().unwrap()
            .get(key)
            .cloned()
    }

    /// Applies `f` to a copy of the current map and publishes the result, returning whatever
    ///  `f` returns.
    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> R) -> R {
        let mut guard = self.map.write().unwrap();
        let mut map: FxHashMap<K,V> = (**guard).clone();
        let result = f(&mut map);
        *guard = Arc::new(map);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
    }

    #[test]
    fn test_snapshot_is_unaffected_by_update() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| { m.insert(1, 1); });

        let snapshot = map.load();
        let removed = map.update(|m| m.remove(&1));

        assert_eq!(removed, Some(1));
        assert_eq!(snapshot.get(&1), Some(&1));
        assert_eq!(map.get(&1), None);
    }

    #[test]
    fn test_concurrent_updates() {
        let map = Arc::new(AtomicMap::<u32, u32>::new());

        let handles = (0..4u32)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        map.update(|m| { m.insert(t * 1000 + i, i); });
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(map.load().len(), 400);
    }
}
