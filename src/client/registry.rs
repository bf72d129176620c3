use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Returned by every registration; unique across all clients in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverHandle(u64);

impl ObserverHandle {
    fn next() -> Self {
        ObserverHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callbacks in insertion order.
pub struct ObserverRegistry<T: ?Sized> {
    entries: Vec<(ObserverHandle, Arc<T>)>,
}

impl<T: ?Sized> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: ?Sized> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, observer: Arc<T>) -> ObserverHandle {
        let handle = ObserverHandle::next();
        self.entries.push((handle, observer));
        handle
    }

    /// Returns whether the handle was registered.
    pub fn remove(&mut self, handle: ObserverHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(h, _)| *h != handle);
        self.entries.len() != before
    }

    pub fn contains(&self, handle: ObserverHandle) -> bool {
        self.entries.iter().any(|(h, _)| *h == handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Copy of the current entries so callbacks can run without holding a lock.
    pub fn snapshot(&self) -> Vec<(ObserverHandle, Arc<T>)> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_is_kept() {
        let mut registry: ObserverRegistry<str> = ObserverRegistry::new();
        let a = registry.insert(Arc::from("a"));
        let b = registry.insert(Arc::from("b"));
        let c = registry.insert(Arc::from("c"));
        assert!(a < b && b < c);

        let names: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|(_, s)| s.to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry: ObserverRegistry<str> = ObserverRegistry::new();
        let a = registry.insert(Arc::from("a"));
        let b = registry.insert(Arc::from("b"));

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert!(!registry.contains(a));
        assert!(registry.contains(b));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.remove(b));
    }
}
