use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifies one registration. Handles are unique across lists, so a builder holding
/// several lists can remove by handle alone.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ObserverHandle(u64);

/// Registration-ordered callbacks, removable by handle.
pub struct ObserverList<F: ?Sized> {
    entries: Vec<(ObserverHandle, Arc<F>)>,
}

impl<F: ?Sized> ObserverList<F> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, observer: Arc<F>) -> ObserverHandle {
        let handle = ObserverHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        self.entries.push((handle, observer));
        handle
    }

    pub fn remove(&mut self, handle: ObserverHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != handle);
        self.entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Copy of the current observers so they can be invoked without holding a lock.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }
}

impl<F: ?Sized> Default for ObserverList<F> {
    fn default() -> Self {
        Self::new()
    }
}
