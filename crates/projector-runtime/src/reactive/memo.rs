#![forbid(unsafe_code)]

//! Values memoized against a dependency signature.
//!
//! # Design
//!
//! [`Memo<K, T>`] caches the last computed value together with the key it
//! was computed for. Asking for the value under the same key returns the
//! cached value; a different key triggers one recomputation. Keys are cheap
//! summaries (slot generations, sizes), so the cost of a view is
//! proportional to how often its data changes, not how often it is read.
//!
//! # Invariants
//!
//! 1. The compute function runs at most once per distinct consecutive key.
//! 2. If the key is unchanged and the memo was not invalidated, the cached
//!    value is returned in O(1) (one `Clone` of `T`).
//! 3. Version increments by exactly 1 per recomputation.
//!
//! # Failure Modes
//!
//! - **Compute function panics**: the previous cached value and key stay in
//!   place, so the next read retries.
//! - **Re-entrant read**: the compute function runs with no borrow held, so
//!   it may read other memos or the same one (which then sees the previous
//!   cached value).

use std::cell::RefCell;
use std::rc::Rc;

struct MemoInner<K, T> {
    cached: Option<(K, T)>,
    version: u64,
}

/// A memoized value keyed by a dependency signature.
///
/// Cloning a `Memo` creates a new handle to the **same** cache.
pub struct Memo<K, T> {
    inner: Rc<RefCell<MemoInner<K, T>>>,
}

impl<K, T> Clone for Memo<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K, T> Default for Memo<K, T> {
    fn default() -> Self {
        Self {
            inner: Rc::new(RefCell::new(MemoInner {
                cached: None,
                version: 0,
            })),
        }
    }
}

impl<K: std::fmt::Debug, T: std::fmt::Debug> std::fmt::Debug for Memo<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Memo")
            .field("cached", &inner.cached)
            .field("version", &inner.version)
            .finish()
    }
}

impl<K: PartialEq, T: Clone> Memo<K, T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `key`, computing it first if the key changed.
    pub fn get_or_compute(&self, key: K, compute: impl FnOnce() -> T) -> T {
        if let Some((cached_key, value)) = &self.inner.borrow().cached
            && *cached_key == key
        {
            return value.clone();
        }
        let value = compute();
        let mut inner = self.inner.borrow_mut();
        inner.cached = Some((key, value.clone()));
        inner.version += 1;
        value
    }

    /// Cached value if it was computed for `key`.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<T> {
        match &self.inner.borrow().cached {
            Some((cached_key, value)) if cached_key == key => Some(value.clone()),
            _ => None,
        }
    }

    /// Whether a read under `key` would recompute.
    #[must_use]
    pub fn is_stale(&self, key: &K) -> bool {
        !matches!(&self.inner.borrow().cached, Some((cached_key, _)) if cached_key == key)
    }

    /// Drop the cached value. The next read recomputes.
    pub fn invalidate(&self) {
        self.inner.borrow_mut().cached = None;
    }

    /// Number of computations so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }
}
