//! Per-process key/value state
//!
//! Every process owns a [`StateMap`]: small string key/value state that
//! survives suspension. Handlers mutate it freely; a background
//! checkpointer periodically flushes dirty maps to a [`StateStore`]. The
//! lock stack ([`StateMap::lock`]/[`StateMap::unlock`]) lets a handler
//! make a multi-key update atomic with respect to the flusher: while any
//! lock is held the flusher waits briefly and then abandons the map until
//! the next sweep rather than checkpointing a half-applied update.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use types::ProcessId;

/// How long a flush waits for the lock stack to empty before abandoning
/// the map until the next sweep.
pub const FLUSH_LOCK_WAIT: Duration = Duration::from_millis(100);

struct MapState {
    entries: HashMap<String, String>,
    lock_count: u32,
    dirty: bool,
}

struct Inner {
    data: Mutex<MapState>,
    cond: Condvar,
}

/// Mutable string map with a reentrant flush-exclusion lock.
#[derive(Clone)]
pub struct StateMap {
    inner: Arc<Inner>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::from_entries(HashMap::new())
    }

    /// Rebuilds a map from a stored snapshot. The result starts clean.
    pub fn from_entries(entries: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(MapState {
                    entries,
                    lock_count: 0,
                    dirty: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.data.lock().entries.get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let mut state = self.inner.data.lock();
        state.dirty = true;
        state.entries.insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        let mut state = self.inner.data.lock();
        let previous = state.entries.remove(key);
        if previous.is_some() {
            state.dirty = true;
        }
        previous
    }

    pub fn len(&self) -> usize {
        self.inner.data.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.lock().entries.is_empty()
    }

    /// Copies the current entries without touching the dirty flag.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner.data.lock().entries.clone()
    }

    /// Pushes onto the flush-exclusion lock stack. Reentrant; each `lock`
    /// must be paired with an `unlock`.
    pub fn lock(&self) {
        self.inner.data.lock().lock_count += 1;
    }

    /// Pops the flush-exclusion lock stack.
    ///
    /// # Panics
    ///
    /// Panics on an unpaired unlock. An unbalanced stack means the caller
    /// lost track of its own critical sections, which would silently
    /// disable flush exclusion for everyone sharing the map.
    pub fn unlock(&self) {
        let mut state = self.inner.data.lock();
        assert!(state.lock_count > 0, "StateMap::unlock without matching lock");
        state.lock_count -= 1;
        if state.lock_count == 0 {
            self.inner.cond.notify_all();
        }
    }

    /// Takes a checkpoint snapshot if the map is dirty and unlockable
    /// within `wait`. Returns `None` when the map is clean or still
    /// locked at the deadline; a `Some` snapshot marks the map clean.
    pub fn try_flush(&self, wait: Duration) -> Option<HashMap<String, String>> {
        let mut state = self.inner.data.lock();
        if !state.dirty {
            return None;
        }
        while state.lock_count > 0 {
            if self.inner.cond.wait_for(&mut state, wait).timed_out() {
                return None;
            }
        }
        state.dirty = false;
        Some(state.entries.clone())
    }
}

impl Default for StateMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.data.lock();
        f.debug_struct("StateMap")
            .field("entries", &state.entries.len())
            .field("dirty", &state.dirty)
            .field("lock_count", &state.lock_count)
            .finish()
    }
}

/// Destination for checkpointed process state.
pub trait StateStore: Send + Sync {
    fn store(&self, id: ProcessId, snapshot: HashMap<String, String>);
    fn load(&self, id: ProcessId) -> Option<HashMap<String, String>>;
    fn remove(&self, id: ProcessId);
}

/// In-memory store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStateStore {
    maps: Mutex<HashMap<ProcessId, HashMap<String, String>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.maps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.lock().is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn store(&self, id: ProcessId, snapshot: HashMap<String, String>) {
        self.maps.lock().insert(id, snapshot);
    }

    fn load(&self, id: ProcessId) -> Option<HashMap<String, String>> {
        self.maps.lock().get(&id).cloned()
    }

    fn remove(&self, id: ProcessId) {
        self.maps.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_insert_get_remove() {
        let map = StateMap::new();
        assert_eq!(map.insert("count", "1"), None);
        assert_eq!(map.get("count").as_deref(), Some("1"));
        assert_eq!(map.insert("count", "2").as_deref(), Some("1"));
        assert_eq!(map.remove("count").as_deref(), Some("2"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_clean_map_does_not_flush() {
        let map = StateMap::new();
        assert!(map.try_flush(FLUSH_LOCK_WAIT).is_none());
        map.insert("a", "1");
        assert!(map.try_flush(FLUSH_LOCK_WAIT).is_some());
        // Flushed once, now clean again.
        assert!(map.try_flush(FLUSH_LOCK_WAIT).is_none());
    }

    #[test]
    fn test_removal_dirties_the_map() {
        let map = StateMap::from_entries(HashMap::from([("a".into(), "1".into())]));
        assert!(map.try_flush(FLUSH_LOCK_WAIT).is_none());
        map.remove("a");
        let snapshot = map.try_flush(FLUSH_LOCK_WAIT).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_flush_abandons_locked_map() {
        let map = StateMap::new();
        map.insert("a", "1");
        map.lock();
        assert!(map.try_flush(Duration::from_millis(10)).is_none());
        map.unlock();
        // Still dirty, so the next sweep picks it up.
        assert!(map.try_flush(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_flush_waits_for_unlock() {
        let map = StateMap::new();
        map.insert("a", "1");
        map.lock();
        let flusher = {
            let map = map.clone();
            thread::spawn(move || map.try_flush(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        map.insert("b", "2");
        map.unlock();
        let snapshot = flusher.join().unwrap().unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_lock_is_reentrant() {
        let map = StateMap::new();
        map.insert("a", "1");
        map.lock();
        map.lock();
        map.unlock();
        assert!(map.try_flush(Duration::from_millis(10)).is_none());
        map.unlock();
        assert!(map.try_flush(Duration::from_millis(10)).is_some());
    }

    #[test]
    #[should_panic(expected = "unlock without matching lock")]
    fn test_unpaired_unlock_panics() {
        StateMap::new().unlock();
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStateStore::new();
        let id = ProcessId::new(3, 100, 200);
        store.store(id, HashMap::from([("k".into(), "v".into())]));
        assert_eq!(store.load(id).unwrap().get("k").map(String::as_str), Some("v"));
        store.remove(id);
        assert!(store.load(id).is_none());
    }
}
