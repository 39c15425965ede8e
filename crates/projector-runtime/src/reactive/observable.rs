#![forbid(unsafe_code)]

//! Shared observable values and RAII subscriptions.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// One registered callback.
struct Subscriber<T> {
    id: u64,
    active: Cell<bool>,
    callback: Box<dyn Fn(&T)>,
}

struct ObservableInner<T> {
    value: T,
    version: u64,
    next_id: u64,
    subscribers: Vec<Rc<Subscriber<T>>>,
}

/// A shared value that notifies subscribers when it changes.
///
/// Cloning an `Observable` creates a new handle to the **same** value.
pub struct Observable<T> {
    inner: Rc<RefCell<ObservableInner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Observable")
            .field("value", &inner.value)
            .field("version", &inner.version)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl<T: Clone + 'static> Observable<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ObservableInner {
                value,
                version: 0,
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.borrow().value.clone()
    }

    /// Borrow the current value for the duration of `f`.
    ///
    /// # Panics
    ///
    /// Panics if `f` mutates this observable.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.borrow().value)
    }

    /// Replace the value unconditionally and notify subscribers.
    pub fn replace(&self, value: T) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.value = value;
            inner.version += 1;
        }
        self.notify();
    }

    /// Compute the next value from the current one, replace it and notify.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.inner.borrow().value);
        self.replace(next);
    }

    /// Number of accepted mutations so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    /// Register `callback`, called with the new value after each mutation.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        let subscriber = {
            let mut inner = self.inner.borrow_mut();
            inner.next_id += 1;
            let subscriber = Rc::new(Subscriber {
                id: inner.next_id,
                active: Cell::new(true),
                callback: Box::new(callback),
            });
            inner.subscribers.push(Rc::clone(&subscriber));
            subscriber
        };

        let id = subscriber.id;
        let weak_inner: Weak<RefCell<ObservableInner<T>>> = Rc::downgrade(&self.inner);
        let weak_subscriber = Rc::downgrade(&subscriber);
        Subscription::new(move || {
            if let Some(subscriber) = weak_subscriber.upgrade() {
                subscriber.active.set(false);
            }
            if let Some(inner) = weak_inner.upgrade() {
                inner.borrow_mut().subscribers.retain(|s| s.id != id);
            }
        })
    }

    fn notify(&self) {
        let (value, subscribers) = {
            let inner = self.inner.borrow();
            (inner.value.clone(), inner.subscribers.clone())
        };
        for subscriber in subscribers {
            if subscriber.active.get() {
                (subscriber.callback)(&value);
            }
        }
    }
}

impl<T: Clone + PartialEq + 'static> Observable<T> {
    /// Set a new value. Equal values are ignored (no version bump, no
    /// notification).
    pub fn set(&self, value: T) {
        if self.inner.borrow().value == value {
            return;
        }
        self.replace(value);
    }
}

/// RAII guard for a registration. Dropping it releases the registration.
pub struct Subscription {
    release: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Wrap a release action. It runs at most once.
    pub fn new(release: impl FnOnce() + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release.
    #[must_use]
    pub fn empty() -> Self {
        Self { release: None }
    }

    /// Release now. Calling this again, or dropping afterwards, is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Whether the registration is still held.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_notifies_and_bumps_version() {
        let obs = Observable::new(1);
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        let _sub = obs.subscribe(move |v| s.set(*v));

        obs.set(5);
        assert_eq!(seen.get(), 5);
        assert_eq!(obs.version(), 1);
    }

    #[test]
    fn equal_set_is_noop() {
        let obs = Observable::new(3);
        let calls = Rc::new(Cell::new(0));
        let c = Rc::clone(&calls);
        let _sub = obs.subscribe(move |_| c.set(c.get() + 1));

        obs.set(3);
        assert_eq!(calls.get(), 0);
        assert_eq!(obs.version(), 0);

        obs.replace(3);
        assert_eq!(calls.get(), 1);
        assert_eq!(obs.version(), 1);
    }

    #[test]
    fn drop_unsubscribes() {
        let obs = Observable::new(0);
        let calls = Rc::new(Cell::new(0));
        let c = Rc::clone(&calls);
        let sub = obs.subscribe(move |_| c.set(c.get() + 1));
        assert_eq!(obs.subscriber_count(), 1);

        drop(sub);
        assert_eq!(obs.subscriber_count(), 0);
        obs.set(1);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn double_unsubscribe_is_noop() {
        let obs = Observable::new(0);
        let mut sub = obs.subscribe(|_| {});
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(obs.subscriber_count(), 0);
    }

    #[test]
    fn registration_order() {
        let obs = Observable::new(0);
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = Rc::clone(&log);
        let l2 = Rc::clone(&log);
        let _a = obs.subscribe(move |_| l1.borrow_mut().push("a"));
        let _b = obs.subscribe(move |_| l2.borrow_mut().push("b"));
        obs.set(1);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn release_during_notification_stops_later_delivery() {
        let obs = Observable::new(0);
        let second: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let hits = Rc::new(Cell::new(0));

        let slot = Rc::clone(&second);
        let _first = obs.subscribe(move |_| {
            if let Some(mut sub) = slot.borrow_mut().take() {
                sub.unsubscribe();
            }
        });
        let h = Rc::clone(&hits);
        *second.borrow_mut() = Some(obs.subscribe(move |_| h.set(h.get() + 1)));

        obs.set(1);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn reentrant_read_inside_callback() {
        let obs = Observable::new(10);
        let probe = obs.clone();
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        let _sub = obs.subscribe(move |_| s.set(probe.get() * 2));
        obs.set(21);
        assert_eq!(seen.get(), 42);
    }

    #[test]
    fn subscription_outlives_observable() {
        let sub;
        {
            let obs = Observable::new(0);
            sub = obs.subscribe(|_| {});
        }
        drop(sub);
    }
}
