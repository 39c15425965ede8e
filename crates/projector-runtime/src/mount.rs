#![forbid(unsafe_code)]

//! The mounted consumer scope.
//!
//! A [`ProjectionScope`] owns everything one consumer needs: the Projection
//! Store, the multiplexer holding the repository subscription, the listener
//! registry, the accessor table, cached relation views and the dispatch
//! binding. Mounting validates the descriptors, builds the bindings and
//! attaches; unmounting (explicitly or by drop) detaches and releases every
//! listener.
//!
//! # Invariants
//!
//! 1. A mounted scope holds exactly one repository subscription; an
//!    unmounted scope holds none.
//! 2. `unmount` is idempotent; `remount` after `unmount` never creates a
//!    second subscription.
//! 3. Misuse (invalid or colliding names, unknown types) is reported at
//!    `mount` or at the offending call, never while a batch is applied.

use std::rc::Rc;

use ahash::AHashMap;
use projector_core::{
    ChangeEvent, EntityId, EntityRepository, Record, StorageKind, TypeDescriptor, TypedEvent,
};
use serde_json::Value;

use crate::accessor::{Accessor, BindingSet};
use crate::config::{ProjectionConfig, ProjectionManifest};
use crate::diagnostics::Diagnostics;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::listener::{ListenerHandle, ListenerRegistry, ListenerSlot, TypeFilter};
use crate::multiplexer::{BatchReport, Multiplexer};
use crate::reactive::BindingScope;
use crate::relation::RelationViews;
use crate::store::{ProjectionState, ProjectionStore};

/// One mounted projection.
pub struct ProjectionScope {
    config: ProjectionConfig,
    store: ProjectionStore,
    bindings: BindingSet,
    listeners: ListenerRegistry,
    multiplexer: Multiplexer,
    relations: RelationViews,
    dispatcher: Dispatcher,
    diagnostics: Diagnostics,
    held: BindingScope,
}

impl std::fmt::Debug for ProjectionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionScope")
            .field("bindings", &self.bindings)
            .field("store", &self.store)
            .field("multiplexer", &self.multiplexer)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl ProjectionScope {
    /// Validate `descriptors`, build the bindings and attach to
    /// `repository`.
    pub fn mount(
        repository: Rc<dyn EntityRepository>,
        descriptors: impl IntoIterator<Item = TypeDescriptor>,
        config: ProjectionConfig,
    ) -> Result<Self> {
        let descriptors: Vec<TypeDescriptor> = descriptors.into_iter().collect();
        let store = ProjectionStore::new(&descriptors);
        let bindings = BindingSet::build(&descriptors, &store, &repository)?;
        let table: Rc<AHashMap<String, TypeDescriptor>> = Rc::new(
            descriptors
                .iter()
                .map(|d| (d.name.clone(), d.clone()))
                .collect(),
        );

        let diagnostics = Diagnostics::with_capacity(config.diagnostics_capacity);
        let listeners = ListenerRegistry::new(table.keys().cloned());
        let multiplexer = Multiplexer::new(
            Rc::clone(&repository),
            store.clone(),
            Rc::clone(&table),
            listeners.clone(),
            diagnostics.clone(),
            config.log_batches,
        );
        let relations = RelationViews::new(
            Rc::clone(&repository),
            store.clone(),
            config.relation_cache_capacity,
        );
        let dispatcher = Dispatcher::new(Rc::clone(&repository), table);

        let scope = Self {
            config,
            store,
            bindings,
            listeners,
            multiplexer,
            relations,
            dispatcher,
            diagnostics,
            held: BindingScope::new(),
        };
        if scope.config.hydrate_on_mount {
            scope.hydrate(&*repository);
        }
        scope.multiplexer.attach()?;
        Ok(scope)
    }

    /// Mount with the config and types of a manifest.
    pub fn from_manifest(
        repository: Rc<dyn EntityRepository>,
        manifest: ProjectionManifest,
    ) -> Result<Self> {
        Self::mount(repository, manifest.types, manifest.projection)
    }

    /// Seed the store from the repository's current contents, through the
    /// same path as a delivered batch.
    fn hydrate(&self, repository: &dyn EntityRepository) -> BatchReport {
        let events: Vec<ChangeEvent> = self
            .bindings
            .iter()
            .map(|(_, accessor)| {
                let records = repository.find_all(accessor.name());
                let payload = match accessor.storage() {
                    StorageKind::Collection => Value::Array(records),
                    StorageKind::Singleton => records.into_iter().next().unwrap_or(Value::Null),
                };
                ChangeEvent::new(accessor.name(), payload)
            })
            .collect();
        self.multiplexer.on_batch(&events)
    }

    #[must_use]
    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    /// Accessor of a registered type.
    pub fn accessor(&self, type_name: &str) -> Result<&Accessor> {
        self.bindings.get(type_name)
    }

    /// Accessor by its PascalCase name.
    pub fn accessor_by_name(&self, accessor_name: &str) -> Result<&Accessor> {
        self.bindings.by_accessor_name(accessor_name)
    }

    #[must_use]
    pub fn bindings(&self) -> &BindingSet {
        &self.bindings
    }

    #[must_use]
    pub fn store(&self) -> &ProjectionStore {
        &self.store
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// A listener slot bound to this scope's registry.
    #[must_use]
    pub fn listener_slot(&self) -> ListenerSlot {
        ListenerSlot::new(&self.listeners)
    }

    /// Listen to one type; called once per matching event.
    pub fn listen(
        &self,
        type_name: &str,
        callback: impl Fn(&TypedEvent) + 'static,
    ) -> Result<ListenerHandle> {
        self.listeners.listen_type(type_name, callback)
    }

    /// Listen to a set of types; called once per batch with the matching
    /// events.
    pub fn listen_many(
        &self,
        filter: TypeFilter,
        callback: impl Fn(&[TypedEvent]) + 'static,
    ) -> Result<ListenerHandle> {
        self.listeners.listen(filter, callback)
    }

    /// Keep a listener attached until unmount.
    pub fn hold(&mut self, handle: ListenerHandle) {
        self.held.hold(handle.into_subscription());
    }

    /// Observe every store transition until unmount.
    pub fn watch(&mut self, callback: impl Fn(&ProjectionState) + 'static) {
        let subscription = self.store.subscribe(callback);
        self.held.hold(subscription);
    }

    /// Related records, re-queried only when either slot changed. Empty
    /// when the repository cannot answer.
    pub fn related(&self, source: &str, id: &EntityId, target: &str) -> Result<Rc<[Record]>> {
        self.relations.related(source, id, target)
    }

    /// Full related data, memoized on the store generation.
    pub fn full_related(
        &self,
        type_name: &str,
        id: Option<&EntityId>,
    ) -> Result<Option<Rc<Value>>> {
        self.relations.full_related(type_name, id)
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.multiplexer.is_attached()
    }

    /// Process a batch as if the repository had delivered it.
    pub fn apply_batch(&self, events: &[ChangeEvent]) -> BatchReport {
        self.multiplexer.on_batch(events)
    }

    /// Detach from the repository, release every listener and discard the
    /// projected data. Safe to call repeatedly.
    pub fn unmount(&mut self) {
        self.multiplexer.detach();
        self.held.clear();
        self.listeners.clear();
        self.store.reset();
        self.relations.clear();
    }

    /// Re-attach after [`unmount`](Self::unmount), hydrating first when
    /// configured to. A mounted scope stays as it is.
    pub fn remount(&mut self) -> Result<()> {
        if self.multiplexer.is_attached() {
            return Ok(());
        }
        if self.config.hydrate_on_mount {
            let repository = self.multiplexer.repository();
            self.hydrate(&*repository);
        }
        self.multiplexer.attach().map(drop)
    }
}

impl Drop for ProjectionScope {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use projector_core::SubscriptionId;
    use projector_harness::MemoryRepository;
    use serde_json::json;
    use std::cell::Cell;

    use crate::error::ProjectionError;

    fn repo() -> Rc<MemoryRepository> {
        Rc::new(
            MemoryRepository::new()
                .with_type(TypeDescriptor::collection("user"))
                .with_type(TypeDescriptor::singleton("session")),
        )
    }

    fn types() -> Vec<TypeDescriptor> {
        vec![
            TypeDescriptor::collection("user"),
            TypeDescriptor::singleton("session"),
        ]
    }

    #[test]
    fn mount_attaches_once() {
        let repo = repo();
        let scope =
            ProjectionScope::mount(repo.clone(), types(), ProjectionConfig::default()).unwrap();
        assert!(scope.is_attached());
        assert_eq!(repo.live_subscriptions(), 1);
        drop(scope);
        assert_eq!(repo.live_subscriptions(), 0);
    }

    #[test]
    fn mount_rejects_misuse() {
        let err = ProjectionScope::mount(
            repo(),
            vec![TypeDescriptor::collection("")],
            ProjectionConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ProjectionError::InvalidTypeName(_)));
    }

    #[test]
    fn unmount_remount_keeps_one_subscription() {
        let repo = repo();
        let mut scope =
            ProjectionScope::mount(repo.clone(), types(), ProjectionConfig::default()).unwrap();
        scope.unmount();
        scope.unmount();
        assert_eq!(repo.live_subscriptions(), 0);
        scope.remount().unwrap();
        scope.remount().unwrap();
        assert_eq!(repo.live_subscriptions(), 1);
        assert_ne!(scope.multiplexer.subscription(), Some(SubscriptionId(1)));
    }

    #[test]
    fn unmount_releases_held_listeners() {
        let repo = repo();
        let mut scope =
            ProjectionScope::mount(repo.clone(), types(), ProjectionConfig::default()).unwrap();
        let calls = Rc::new(Cell::new(0));
        let c = Rc::clone(&calls);
        let handle = scope.listen("user", move |_| c.set(c.get() + 1)).unwrap();
        scope.hold(handle);
        let w = Rc::clone(&calls);
        scope.watch(move |_| w.set(w.get() + 10));

        repo.merge_data("user", json!([{"id": 1}])).unwrap();
        assert_eq!(calls.get(), 11);

        scope.unmount();
        scope.remount().unwrap();
        repo.merge_data("user", json!([{"id": 2}])).unwrap();
        assert_eq!(calls.get(), 11);
        assert_eq!(scope.accessor("user").unwrap().len(), 2);
    }

    #[test]
    fn hydrate_on_mount_seeds_store() {
        let repo = repo();
        repo.merge_data("user", json!([{"id": 1}, {"id": 2}])).unwrap();
        repo.merge_data("session", json!({"token": "t"})).unwrap();

        let cold =
            ProjectionScope::mount(repo.clone(), types(), ProjectionConfig::default()).unwrap();
        assert!(cold.accessor("user").unwrap().is_empty());

        let warm = ProjectionScope::mount(
            repo.clone(),
            types(),
            ProjectionConfig::default().with_hydrate_on_mount(true),
        )
        .unwrap();
        assert_eq!(warm.accessor("user").unwrap().len(), 2);
        assert_eq!(
            warm.accessor_by_name("Session").unwrap().single().unwrap()["token"],
            "t"
        );
        assert_eq!(warm.diagnostics().counters().batches, 1);
    }

    #[test]
    fn from_manifest() {
        let manifest = ProjectionManifest::from_json_str(
            r#"{"types": [{"name": "user", "storage": "collection"}]}"#,
        )
        .unwrap();
        let scope = ProjectionScope::from_manifest(repo(), manifest).unwrap();
        assert_eq!(scope.bindings().len(), 1);
        assert!(scope.config().log_batches);
    }
}
