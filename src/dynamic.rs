//! Live-updatable configuration handles.
//!
//! The adaptive algorithm consumes load signals that an external feedback
//! loop publishes while requests are in flight. `DynamicConfig` gives that
//! loop a handle with lock-free reads on the hot path (`ArcSwap`) and
//! last-writer-wins updates from the publisher side.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared handle to a value that readers snapshot cheaply and writers replace
/// wholesale. Clones share the same underlying slot.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Default> Default for DynamicConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value. The returned `Arc` stays valid even if a
    /// writer replaces the slot while the reader still holds it.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive the next value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.inner.load_full();
        self.inner.store(Arc::new(f(&current)));
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;

    #[test]
    fn get_set_update() {
        let config = DynamicConfig::new(1);
        assert_eq!(*config.get(), 1);
        config.set(2);
        assert_eq!(*config.get(), 2);
        config.update(|v| v + 3);
        assert_eq!(*config.get(), 5);
    }

    #[test]
    fn clones_observe_writes() {
        let config = DynamicConfig::new("a");
        let reader = config.clone();
        config.set("b");
        assert_eq!(*reader.get(), "b");
    }

    #[test]
    fn snapshot_survives_replacement() {
        let config = DynamicConfig::new(vec![1, 2, 3]);
        let snapshot = config.get();
        config.set(vec![]);
        assert_eq!(*snapshot, vec![1, 2, 3]);
    }
}
