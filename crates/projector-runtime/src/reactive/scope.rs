#![forbid(unsafe_code)]

//! Lifecycle grouping for the registrations of one consumer.

use super::observable::{Observable, Subscription};

/// Collects subscriptions for a logical consumer (a mounted view, a
/// component, a test fixture).
///
/// When the scope is dropped or cleared, every held subscription is
/// released, last registered first.
///
/// # Invariants
///
/// 1. After `clear()` or drop, no callback registered through this scope
///    fires again.
/// 2. `clear()` leaves the scope empty and reusable.
/// 3. `len()` counts held registrations, released or not by other means.
#[derive(Default)]
pub struct BindingScope {
    subscriptions: Vec<Subscription>,
}

impl BindingScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `subscription` alive until the scope is cleared or dropped.
    pub fn hold(&mut self, subscription: Subscription) -> &mut Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Subscribe to an observable within this scope.
    pub fn subscribe<T: Clone + 'static>(
        &mut self,
        source: &Observable<T>,
        callback: impl Fn(&T) + 'static,
    ) -> &mut Self {
        let sub = source.subscribe(callback);
        self.hold(sub)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Release everything now.
    pub fn clear(&mut self) {
        while let Some(mut sub) = self.subscriptions.pop() {
            sub.unsubscribe();
        }
    }
}

impl Drop for BindingScope {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for BindingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingScope")
            .field("len", &self.subscriptions.len())
            .finish()
    }
}
