#![forbid(unsafe_code)]

//! Per-type and cross-type change listeners.
//!
//! Listeners share the scope's single repository subscription: the
//! multiplexer hands every applied batch to [`ListenerRegistry::deliver`],
//! which filters it per listener. Payloads are already normalized, so a
//! singleton listener always sees a record or nothing and a collection
//! listener always sees a record list.
//!
//! # Invariants
//!
//! 1. A listener is never invoked with an empty filtered batch.
//! 2. A detached listener receives nothing after `detach` returns, even
//!    when it is detached by another listener of the same delivery.
//! 3. Detaching twice is a no-op.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashSet;
use projector_core::TypedEvent;

use crate::error::{ProjectionError, Result};
use crate::reactive::Subscription;

/// Callback receiving the filtered events of one batch.
pub type BatchListener = Rc<dyn Fn(&[TypedEvent])>;

/// Callback receiving one matching event.
pub type EventListener = Rc<dyn Fn(&TypedEvent)>;

/// Which types a listener wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeFilter {
    All,
    /// Sorted and deduplicated.
    Only(Rc<[String]>),
}

impl TypeFilter {
    /// Filter over `types`, in any order and possibly repeated.
    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = types.into_iter().map(Into::into).collect();
        names.sort_unstable();
        names.dedup();
        Self::Only(names.into())
    }

    pub fn single(type_name: impl Into<String>) -> Self {
        let name: String = type_name.into();
        Self::Only(Rc::from([name]))
    }

    #[must_use]
    pub fn matches(&self, type_name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names
                .binary_search_by(|n| n.as_str().cmp(type_name))
                .is_ok(),
        }
    }

    /// Stable identity of the filter: sorted names joined by commas, or `*`.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::All => "*".to_owned(),
            Self::Only(names) => names.join(","),
        }
    }

    fn names(&self) -> &[String] {
        match self {
            Self::All => &[],
            Self::Only(names) => names,
        }
    }
}

enum Callback {
    Batch(BatchListener),
    Each(EventListener),
}

struct ListenerEntry {
    id: u64,
    filter: TypeFilter,
    active: Cell<bool>,
    callback: Callback,
}

impl ListenerEntry {
    fn deliver(&self, events: &[TypedEvent]) {
        match &self.callback {
            Callback::Batch(callback) => {
                let matching: Vec<TypedEvent> = events
                    .iter()
                    .filter(|e| self.filter.matches(&e.type_name))
                    .cloned()
                    .collect();
                if !matching.is_empty() && self.active.get() {
                    callback(&matching);
                }
            }
            Callback::Each(callback) => {
                for event in events.iter().filter(|e| self.filter.matches(&e.type_name)) {
                    if !self.active.get() {
                        return;
                    }
                    callback(event);
                }
            }
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<Rc<ListenerEntry>>,
    delivered: u64,
}

/// The listeners of one scope.
///
/// Cloning creates a new handle to the same registry.
#[derive(Clone)]
pub struct ListenerRegistry {
    inner: Rc<RefCell<RegistryInner>>,
    known: Rc<AHashSet<String>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &inner.entries.len())
            .field("delivered", &inner.delivered)
            .finish()
    }
}

impl ListenerRegistry {
    /// A registry accepting filters over `known` type names.
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Rc::default(),
            known: Rc::new(known.into_iter().map(Into::into).collect()),
        }
    }

    /// Register a cross-type listener, called once per batch with the
    /// events that pass `filter`.
    pub fn listen(
        &self,
        filter: TypeFilter,
        callback: impl Fn(&[TypedEvent]) + 'static,
    ) -> Result<ListenerHandle> {
        self.register(filter, Callback::Batch(Rc::new(callback)))
    }

    /// Register a listener for one type, called once per matching event in
    /// batch order.
    pub fn listen_type(
        &self,
        type_name: &str,
        callback: impl Fn(&TypedEvent) + 'static,
    ) -> Result<ListenerHandle> {
        self.register(TypeFilter::single(type_name), Callback::Each(Rc::new(callback)))
    }

    /// Like [`listen`](Self::listen) with a shared callback.
    pub fn listen_shared(
        &self,
        filter: TypeFilter,
        callback: BatchListener,
    ) -> Result<ListenerHandle> {
        self.register(filter, Callback::Batch(callback))
    }

    fn register(&self, filter: TypeFilter, callback: Callback) -> Result<ListenerHandle> {
        if let Some(unknown) = filter.names().iter().find(|n| !self.known.contains(*n)) {
            return Err(ProjectionError::unknown_type(unknown.as_str()));
        }
        let entry = {
            let mut inner = self.inner.borrow_mut();
            inner.next_id += 1;
            let entry = Rc::new(ListenerEntry {
                id: inner.next_id,
                filter,
                active: Cell::new(true),
                callback,
            });
            inner.entries.push(Rc::clone(&entry));
            entry
        };
        Ok(ListenerHandle {
            id: entry.id,
            entry: Rc::downgrade(&entry),
            registry: Rc::downgrade(&self.inner),
        })
    }

    /// Hand an applied batch to every attached listener.
    pub fn deliver(&self, events: &[TypedEvent]) {
        if events.is_empty() {
            return;
        }
        let entries = {
            let mut inner = self.inner.borrow_mut();
            inner.delivered += 1;
            inner.entries.clone()
        };
        for entry in entries {
            if entry.active.get() {
                entry.deliver(events);
            }
        }
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach every listener.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut self.inner.borrow_mut().entries);
        for entry in entries {
            entry.active.set(false);
        }
    }
}

/// Owner of one listener registration. Dropping it detaches.
#[must_use = "dropping a ListenerHandle detaches the listener"]
pub struct ListenerHandle {
    id: u64,
    entry: Weak<ListenerEntry>,
    registry: Weak<RefCell<RegistryInner>>,
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl ListenerHandle {
    /// Stop deliveries to this listener. Safe to call repeatedly.
    pub fn detach(&self) {
        let Some(entry) = self.entry.upgrade() else {
            return;
        };
        if !entry.active.replace(false) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.borrow_mut().entries.retain(|e| e.id != self.id);
        }
        tracing::trace!(message = "projection.listener_detach", listener = self.id);
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.entry.upgrade().is_some_and(|e| e.active.get())
    }

    /// Convert into a plain [`Subscription`] for use with a
    /// [`BindingScope`](crate::reactive::BindingScope).
    pub fn into_subscription(self) -> Subscription {
        Subscription::new(move || self.detach())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

/// A listener binding that survives repeated re-binding by a consumer.
///
/// Calling [`sync`](Self::sync) with the same callback pointer and an
/// equal filter keeps the existing registration; anything else replaces
/// it.
#[derive(Debug)]
pub struct ListenerSlot {
    registry: ListenerRegistry,
    current: Option<(BindingKey, ListenerHandle)>,
    registrations: u64,
}

struct BindingKey {
    callback: BatchListener,
    filter: String,
}

impl fmt::Debug for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingKey").field("filter", &self.filter).finish()
    }
}

impl ListenerSlot {
    #[must_use]
    pub fn new(registry: &ListenerRegistry) -> Self {
        Self {
            registry: registry.clone(),
            current: None,
            registrations: 0,
        }
    }

    /// Ensure `callback` is registered under `filter`. Returns whether a new
    /// registration was made.
    pub fn sync(&mut self, callback: BatchListener, filter: TypeFilter) -> Result<bool> {
        let key = filter.key();
        if let Some((current, handle)) = &self.current
            && Rc::ptr_eq(&current.callback, &callback)
            && current.filter == key
            && handle.is_attached()
        {
            return Ok(false);
        }
        let handle = self.registry.listen_shared(filter, Rc::clone(&callback))?;
        // The old registration goes only after the new one succeeded.
        self.current = Some((
            BindingKey {
                callback,
                filter: key,
            },
            handle,
        ));
        self.registrations += 1;
        Ok(true)
    }

    /// Number of registrations made so far.
    #[must_use]
    pub fn registrations(&self) -> u64 {
        self.registrations
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.current.as_ref().is_some_and(|(_, h)| h.is_attached())
    }

    pub fn release(&mut self) {
        self.current = None;
    }
}
