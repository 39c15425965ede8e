#![forbid(unsafe_code)]

//! The Subscription Multiplexer: one repository subscription per scope,
//! fanned out into the Projection Store and the scope's listeners.
//!
//! # Design
//!
//! The multiplexer holds at most one [`SubscriptionId`]. The callback it
//! registers with the repository only holds a weak reference to the
//! multiplexer state plus the attachment epoch it was created for, so a
//! callback outliving its attachment (for example one captured by a
//! repository mid-emit) does nothing.
//!
//! For each delivered batch:
//!
//! 1. every event is resolved against the registered descriptor and
//!    normalized into a slot change; unregistered types are ignored and
//!    malformed events are recorded as faults and skipped,
//! 2. the surviving changes are composed in order into one
//!    [`StoreTransition`] and applied, so dependents see one state change,
//! 3. the normalized events are handed to the listener registry.
//!
//! # Invariants
//!
//! 1. At most one repository subscription is live per multiplexer.
//! 2. An event either replaces its slot completely or leaves it untouched.
//! 3. A fault in one event never prevents later events of the same batch
//!    from applying.
//! 4. No delivery is processed after `detach` returns.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use projector_core::{
    BatchCallback, ChangeEvent, EntityRepository, SubscribeOptions, SubscriptionId,
    TypeDescriptor, TypedEvent,
};

use crate::diagnostics::Diagnostics;
use crate::error::{ProjectionError, Result};
use crate::listener::ListenerRegistry;
use crate::normalize::normalize_event;
use crate::store::{ProjectionStore, StoreTransition};

/// Outcome of processing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Sequence number of the batch within the scope.
    pub batch: u64,
    pub applied: usize,
    pub ignored: usize,
    pub faulted: usize,
    /// Store generation after the batch, if anything was applied.
    pub generation: Option<u64>,
}

struct Shared {
    store: ProjectionStore,
    descriptors: Rc<AHashMap<String, TypeDescriptor>>,
    listeners: ListenerRegistry,
    diagnostics: Diagnostics,
    log_batches: bool,
    epoch: Cell<u64>,
}

impl Shared {
    fn on_batch(&self, events: &[ChangeEvent]) -> BatchReport {
        let batch = self.diagnostics.begin_batch();
        let state = self.store.state();
        let mut transition = StoreTransition::new();
        let mut typed = Vec::with_capacity(events.len());
        let mut report = BatchReport {
            batch,
            ..BatchReport::default()
        };

        for event in events {
            let Some(descriptor) = self.descriptors.get(&event.type_name) else {
                tracing::trace!(
                    message = "projection.event_ignored",
                    type_name = %event.type_name
                );
                self.diagnostics.record_ignored();
                report.ignored += 1;
                continue;
            };
            match normalize_event(descriptor, &event.payload) {
                Ok(change) => {
                    let current = transition.current(&state, &descriptor.name);
                    if !change.is_noop(current) {
                        let next = change.apply(current);
                        transition.set(descriptor.name.clone(), next);
                    }
                    typed.push(TypedEvent {
                        type_name: descriptor.name.clone(),
                        payload: change.to_typed(),
                    });
                    report.applied += 1;
                }
                Err(fault) => {
                    tracing::warn!(
                        message = "projection.event_fault",
                        type_name = %event.type_name,
                        batch,
                        error = %fault
                    );
                    self.diagnostics.record_fault(batch, fault);
                    report.faulted += 1;
                }
            }
        }

        self.diagnostics.record_applied(report.applied as u64);
        report.generation = self.store.apply(transition);
        if self.log_batches {
            tracing::debug!(
                message = "projection.batch",
                batch,
                events = events.len(),
                applied = report.applied,
                ignored = report.ignored,
                faulted = report.faulted,
                generation = report.generation.unwrap_or_else(|| self.store.generation())
            );
        }
        self.listeners.deliver(&typed);
        report
    }
}

/// Owner of a scope's repository subscription.
pub struct Multiplexer {
    repository: Rc<dyn EntityRepository>,
    shared: Rc<Shared>,
    handle: Cell<Option<SubscriptionId>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("handle", &self.handle.get())
            .field("epoch", &self.shared.epoch.get())
            .field("types", &self.shared.descriptors.len())
            .finish()
    }
}

impl Multiplexer {
    pub(crate) fn new(
        repository: Rc<dyn EntityRepository>,
        store: ProjectionStore,
        descriptors: Rc<AHashMap<String, TypeDescriptor>>,
        listeners: ListenerRegistry,
        diagnostics: Diagnostics,
        log_batches: bool,
    ) -> Self {
        Self {
            repository,
            shared: Rc::new(Shared {
                store,
                descriptors,
                listeners,
                diagnostics,
                log_batches,
                epoch: Cell::new(0),
            }),
            handle: Cell::new(None),
        }
    }

    /// Subscribe to the repository for every registered type.
    ///
    /// Fails with [`ProjectionError::AlreadyAttached`] while a subscription
    /// is held.
    pub fn attach(&self) -> Result<SubscriptionId> {
        if self.handle.get().is_some() {
            return Err(ProjectionError::AlreadyAttached);
        }
        let epoch = self.shared.epoch.get() + 1;
        self.shared.epoch.set(epoch);

        let weak: Weak<Shared> = Rc::downgrade(&self.shared);
        let callback: BatchCallback = Rc::new(move |events: &[ChangeEvent]| {
            if let Some(shared) = weak.upgrade()
                && shared.epoch.get() == epoch
            {
                shared.on_batch(events);
            }
        });
        let mut types: Vec<&String> = self.shared.descriptors.keys().collect();
        types.sort_unstable();
        let id = self
            .repository
            .subscribe(callback, SubscribeOptions::types(types.into_iter().cloned()));
        self.handle.set(Some(id));
        tracing::debug!(message = "projection.attach", subscription = %id, epoch);
        Ok(id)
    }

    /// Release the subscription. Returns whether one was held.
    pub fn detach(&self) -> bool {
        let Some(id) = self.handle.take() else {
            return false;
        };
        // A repository may still hold the callback for the rest of an emit.
        self.shared.epoch.set(self.shared.epoch.get() + 1);
        let released = self.repository.unsubscribe(id);
        tracing::debug!(message = "projection.detach", subscription = %id, released);
        true
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.handle.get().is_some()
    }

    /// The repository this multiplexer subscribes to.
    #[must_use]
    pub fn repository(&self) -> Rc<dyn EntityRepository> {
        Rc::clone(&self.repository)
    }

    /// The live subscription, if attached.
    #[must_use]
    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.handle.get()
    }

    /// Process a batch as if the repository had delivered it.
    pub fn on_batch(&self, events: &[ChangeEvent]) -> BatchReport {
        self.shared.on_batch(events)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use projector_core::{StorageKind, TypedPayload};
    use projector_harness::MemoryRepository;
    use serde_json::json;
    use std::cell::RefCell;

    use crate::store::TypeSlot;

    struct Fixture {
        repo: Rc<MemoryRepository>,
        store: ProjectionStore,
        listeners: ListenerRegistry,
        diagnostics: Diagnostics,
        mux: Multiplexer,
    }

    fn descriptors() -> [TypeDescriptor; 2] {
        [
            TypeDescriptor::collection("user"),
            TypeDescriptor::singleton("session"),
        ]
    }

    fn fixture_with(repo: MemoryRepository) -> Fixture {
        let descriptors = descriptors();
        let repo = Rc::new(
            repo.with_type(descriptors[0].clone())
                .with_type(descriptors[1].clone())
                .with_type(TypeDescriptor::collection("audit")),
        );
        let store = ProjectionStore::new(&descriptors);
        let table: AHashMap<String, TypeDescriptor> = descriptors
            .iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();
        let listeners = ListenerRegistry::new(table.keys().cloned());
        let diagnostics = Diagnostics::with_capacity(8);
        let mux = Multiplexer::new(
            repo.clone(),
            store.clone(),
            Rc::new(table),
            listeners.clone(),
            diagnostics.clone(),
            true,
        );
        Fixture {
            repo,
            store,
            listeners,
            diagnostics,
            mux,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryRepository::new())
    }

    #[test]
    fn attach_twice_is_rejected() {
        let f = fixture();
        f.mux.attach().unwrap();
        assert!(matches!(f.mux.attach(), Err(ProjectionError::AlreadyAttached)));
        assert_eq!(f.repo.live_subscriptions(), 1);
    }

    #[test]
    fn detach_is_idempotent() {
        let f = fixture();
        f.mux.attach().unwrap();
        assert!(f.mux.detach());
        assert!(!f.mux.detach());
        assert_eq!(f.repo.live_subscriptions(), 0);
    }

    #[test]
    fn drop_detaches() {
        let f = fixture();
        f.mux.attach().unwrap();
        let repo = Rc::clone(&f.repo);
        drop(f);
        assert_eq!(repo.live_subscriptions(), 0);
    }

    #[test]
    fn batch_is_one_transition() {
        let f = fixture();
        f.mux.attach().unwrap();
        let notes = Rc::new(Cell::new(0));
        let n = Rc::clone(&notes);
        let _sub = f.store.subscribe(move |_| n.set(n.get() + 1));

        f.repo.emit(vec![
            ChangeEvent::new("user", json!([{"id": 1}])),
            ChangeEvent::new("session", json!({"token": "t"})),
            ChangeEvent::new("user", json!({"2": {"id": 2}})),
        ]);
        assert_eq!(notes.get(), 1);
        assert_eq!(f.store.len("user"), 2);
        assert_eq!(f.store.len("session"), 1);
    }

    #[test]
    fn unknown_and_faulty_events_do_not_block_others() {
        let f = fixture();
        let report = f.mux.on_batch(&[
            ChangeEvent::new("audit", json!([{"id": 1}])),
            ChangeEvent::new("user", json!([{"no_id": true}])),
            ChangeEvent::new("session", json!({"token": "t"})),
        ]);
        assert_eq!(report.applied, 1);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.faulted, 1);
        assert_eq!(
            f.store.slot("user"),
            Some(TypeSlot::empty(StorageKind::Collection))
        );
        assert_eq!(f.store.len("session"), 1);

        let counters = f.diagnostics.counters();
        assert_eq!(counters.events_faulted, 1);
        assert_eq!(counters.events_ignored, 1);
        assert_eq!(
            f.diagnostics.last_fault().map(|r| r.batch),
            Some(report.batch)
        );
    }

    #[test]
    fn all_faulted_batch_changes_nothing() {
        let f = fixture();
        let report = f.mux.on_batch(&[ChangeEvent::new("session", json!(12))]);
        assert_eq!(report.generation, None);
        assert_eq!(f.store.generation(), 0);
    }

    #[test]
    fn listeners_receive_normalized_singletons() {
        let f = fixture_with(MemoryRepository::new().singletons_as_arrays());
        f.mux.attach().unwrap();
        let seen: Rc<RefCell<Vec<TypedPayload>>> = Rc::default();
        let s = Rc::clone(&seen);
        let _h = f
            .listeners
            .listen_type("session", move |e| s.borrow_mut().push(e.payload.clone()))
            .unwrap();

        f.repo.merge_data("session", json!({"token": "a"})).unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].single().map(|r| r["token"].clone()),
            Some(json!("a"))
        );
    }

    #[test]
    fn detached_multiplexer_stops_applying() {
        let f = fixture();
        f.mux.attach().unwrap();
        f.mux.detach();
        f.repo.emit(vec![ChangeEvent::new("user", json!([{"id": 1}]))]);
        assert_eq!(f.store.len("user"), 0);
    }

    #[test]
    fn reattach_uses_a_fresh_subscription() {
        let f = fixture();
        let first = f.mux.attach().unwrap();
        f.mux.detach();
        let second = f.mux.attach().unwrap();
        assert_ne!(first, second);
        assert_eq!(f.repo.live_subscriptions(), 1);
        f.repo.emit(vec![ChangeEvent::new("user", json!([{"id": 1}]))]);
        assert_eq!(f.store.len("user"), 1);
    }

    #[test]
    fn empty_delta_keeps_slot_generation() {
        let f = fixture();
        f.mux.attach().unwrap();
        f.repo.emit(vec![ChangeEvent::new("user", json!([{"id": 1}]))]);
        let before = f.store.slot_generation("user");

        let report = f.mux.on_batch(&[
            ChangeEvent::new("user", json!({})),
            ChangeEvent::new("user", json!({"404": null})),
        ]);
        assert_eq!(report.applied, 2);
        assert_eq!(report.generation, None);
        assert_eq!(f.store.slot_generation("user"), before);
    }

    #[test]
    fn detach_during_emit_silences_the_captured_callback() {
        let f = Rc::new(fixture());
        let weak = Rc::downgrade(&f);
        let earlier: BatchCallback = Rc::new(move |_: &[ChangeEvent]| {
            if let Some(f) = weak.upgrade() {
                f.mux.detach();
            }
        });
        let earlier_id = f.repo.subscribe(earlier, SubscribeOptions::all());
        f.mux.attach().unwrap();
        let before = f.store.generation();

        f.repo.emit(vec![ChangeEvent::new("user", json!([{"id": 1}]))]);
        assert!(!f.mux.is_attached());
        assert_eq!(f.store.generation(), before);
        assert_eq!(f.store.len("user"), 0);
        assert!(f.repo.unsubscribe(earlier_id));
    }
}
