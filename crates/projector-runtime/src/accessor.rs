#![forbid(unsafe_code)]

//! Accessor bindings generated from type descriptors.
//!
//! [`BindingSet::build`] validates a descriptor list once and produces one
//! [`Accessor`] per type, keyed by the PascalCase accessor name. There is
//! no per-type code: every accessor is the same struct parameterized by its
//! descriptor.
//!
//! # Derived views
//!
//! [`Accessor::view`] is memoized on the slot generation. Between two
//! changes of the slot, every call returns the same `Rc` pointers for
//! `items` and `by_id`; after a change, both are rebuilt once.
//!
//! # Failure Modes
//!
//! - Invalid, duplicate or colliding type names fail `build` with a
//!   [`ProjectionError`]; nothing is constructed.
//! - Lookups of unknown types or accessor names fail with
//!   [`ProjectionError::UnknownType`] / [`ProjectionError::UnknownAccessor`].
//! - Missing ids are `None`, never errors.

use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;
use projector_core::{
    EntityId, EntityRepository, Record, RecordRef, StorageKind, TypeDescriptor,
    validate_type_name,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{ProjectionError, Result};
use crate::reactive::Memo;
use crate::store::{IdMap, ProjectionStore, TypeSlot};

/// Names a type contributes to a binding set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingNames {
    pub accessor: String,
    pub listener: String,
    pub related: String,
    pub full_related: String,
}

impl BindingNames {
    #[must_use]
    pub fn for_descriptor(descriptor: &TypeDescriptor) -> Self {
        let accessor = descriptor.accessor_name();
        Self {
            listener: format!("{accessor}Listener"),
            related: format!("{accessor}Related"),
            full_related: format!("{accessor}FullRelatedData"),
            accessor,
        }
    }

    fn all(&self) -> [&str; 4] {
        [
            self.accessor.as_str(),
            self.listener.as_str(),
            self.related.as_str(),
            self.full_related.as_str(),
        ]
    }
}

/// Check a descriptor list for binding-factory misuse.
///
/// Returns the binding names of each descriptor, in order.
pub fn validate_descriptors(descriptors: &[TypeDescriptor]) -> Result<Vec<BindingNames>> {
    let mut owners: AHashMap<String, &str> = AHashMap::with_capacity(descriptors.len() * 4);
    let mut seen: AHashSet<&str> = AHashSet::with_capacity(descriptors.len());
    let mut names = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        validate_type_name(&descriptor.name)?;
        if !seen.insert(descriptor.name.as_str()) {
            return Err(ProjectionError::DuplicateType {
                name: descriptor.name.clone(),
            });
        }
        let binding = BindingNames::for_descriptor(descriptor);
        for name in binding.all() {
            if let Some(first) = owners.insert(name.to_owned(), &descriptor.name) {
                return Err(ProjectionError::AccessorNameCollision {
                    first: first.to_owned(),
                    second: descriptor.name.clone(),
                    accessor: name.to_owned(),
                });
            }
        }
        names.push(binding);
    }
    Ok(names)
}

/// A memoized projection of one slot.
#[derive(Debug, Clone)]
pub struct DerivedView {
    /// Every record; for a singleton, the record or nothing.
    pub items: Rc<[RecordRef]>,
    /// Collection records by identity. Empty for singletons.
    pub by_id: Rc<IdMap>,
    /// The singleton record. Always `None` for collections.
    pub single: Option<RecordRef>,
    /// Slot generation the view was built from.
    pub generation: u64,
}

impl DerivedView {
    fn from_slot(slot: TypeSlot, generation: u64) -> Self {
        match slot {
            TypeSlot::Collection(map) => Self {
                items: map.values().cloned().collect(),
                by_id: map,
                single: None,
                generation,
            },
            TypeSlot::Singleton(record) => Self {
                items: record.iter().cloned().collect(),
                by_id: Rc::default(),
                single: record,
                generation,
            },
        }
    }

    /// Whether both views share `items` and `by_id` pointers.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.items, &other.items) && Rc::ptr_eq(&self.by_id, &other.by_id)
    }
}

/// Result of calling an accessor with or without an id.
#[derive(Debug, Clone)]
pub enum AccessorOutput {
    View(DerivedView),
    Record(Option<RecordRef>),
}

struct AccessorInner {
    descriptor: TypeDescriptor,
    names: BindingNames,
    store: ProjectionStore,
    repository: Rc<dyn EntityRepository>,
    view: Memo<u64, DerivedView>,
}

/// Bound view, lookup and mutation entry points for one type.
///
/// Cloning creates a new handle to the same binding.
#[derive(Clone)]
pub struct Accessor {
    inner: Rc<AccessorInner>,
}

impl std::fmt::Debug for Accessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accessor")
            .field("type", &self.inner.descriptor.name)
            .field("accessor", &self.inner.names.accessor)
            .field("storage", &self.inner.descriptor.storage)
            .finish()
    }
}

impl Accessor {
    fn new(
        descriptor: TypeDescriptor,
        names: BindingNames,
        store: ProjectionStore,
        repository: Rc<dyn EntityRepository>,
    ) -> Self {
        Self {
            inner: Rc::new(AccessorInner {
                descriptor,
                names,
                store,
                repository,
                view: Memo::new(),
            }),
        }
    }

    /// The registered type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    #[must_use]
    pub fn accessor_name(&self) -> &str {
        &self.inner.names.accessor
    }

    #[must_use]
    pub fn binding_names(&self) -> &BindingNames {
        &self.inner.names
    }

    #[must_use]
    pub fn storage(&self) -> StorageKind {
        self.inner.descriptor.storage
    }

    #[must_use]
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.inner.descriptor
    }

    /// The current derived view.
    #[must_use]
    pub fn view(&self) -> DerivedView {
        let inner = &self.inner;
        let generation = inner.store.slot_generation(&inner.descriptor.name);
        inner.view.get_or_compute(generation, || {
            let slot = inner
                .store
                .slot(&inner.descriptor.name)
                .unwrap_or_else(|| TypeSlot::empty(inner.descriptor.storage));
            DerivedView::from_slot(slot, generation)
        })
    }

    /// Every record. A singleton yields zero or one.
    #[must_use]
    pub fn list(&self) -> Rc<[RecordRef]> {
        self.view().items
    }

    /// The singleton record; `None` for collections.
    #[must_use]
    pub fn single(&self) -> Option<RecordRef> {
        self.view().single
    }

    /// Identity lookup; `None` when absent or for singletons.
    #[must_use]
    pub fn by_id(&self, id: &EntityId) -> Option<RecordRef> {
        self.view().by_id.get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.view().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Without an id, the full view; with one, that record.
    #[must_use]
    pub fn invoke(&self, id: Option<EntityId>) -> AccessorOutput {
        match id {
            None => AccessorOutput::View(self.view()),
            Some(id) => AccessorOutput::Record(self.by_id(&id)),
        }
    }

    /// Forward a patch to the repository. The store changes only when the
    /// repository emits the resulting batch.
    pub fn merge(&self, patch: Value) -> Result<Vec<Record>> {
        Ok(self
            .inner
            .repository
            .merge_data(&self.inner.descriptor.name, patch)?)
    }

    /// Remove everything this type currently projects, through `merge`.
    pub fn clear(&self) -> Result<()> {
        let patch = match self.storage() {
            StorageKind::Singleton => Value::Null,
            StorageKind::Collection => {
                let view = self.view();
                if view.by_id.is_empty() {
                    return Ok(());
                }
                let deletes: Map<String, Value> = view
                    .by_id
                    .keys()
                    .map(|id| (id.as_str().to_owned(), Value::Null))
                    .collect();
                Value::Object(deletes)
            }
        };
        self.merge(patch).map(drop)
    }

    /// Read a record straight from the repository.
    #[must_use]
    pub fn find_by_id(&self, id: &EntityId) -> Option<Record> {
        self.inner
            .repository
            .find_by_id(&self.inner.descriptor.name, id)
    }

    /// Read every record straight from the repository.
    #[must_use]
    pub fn find_all(&self) -> Vec<Record> {
        self.inner.repository.find_all(&self.inner.descriptor.name)
    }

    pub fn decode_list<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.list()
            .iter()
            .map(|record| Ok(T::deserialize(&**record)?))
            .collect()
    }

    pub fn decode_by_id<T: DeserializeOwned>(&self, id: &EntityId) -> Result<Option<T>> {
        self.by_id(id)
            .map(|record| T::deserialize(&*record))
            .transpose()
            .map_err(Into::into)
    }

    pub fn decode_single<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.single()
            .map(|record| T::deserialize(&*record))
            .transpose()
            .map_err(Into::into)
    }

    /// Number of times the view was rebuilt.
    #[must_use]
    pub fn view_builds(&self) -> u64 {
        self.inner.view.version()
    }
}

/// The construction-time accessor table of a scope.
#[derive(Clone)]
pub struct BindingSet {
    accessors: IndexMap<String, Accessor, ahash::RandomState>,
    by_type: AHashMap<String, usize>,
}

impl std::fmt::Debug for BindingSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.accessors.keys()).finish()
    }
}

impl BindingSet {
    /// Validate `descriptors` and build one accessor per type.
    pub fn build(
        descriptors: &[TypeDescriptor],
        store: &ProjectionStore,
        repository: &Rc<dyn EntityRepository>,
    ) -> Result<Self> {
        let names = validate_descriptors(descriptors)?;
        let mut accessors =
            IndexMap::with_capacity_and_hasher(descriptors.len(), ahash::RandomState::default());
        let mut by_type = AHashMap::with_capacity(descriptors.len());
        for (descriptor, names) in descriptors.iter().zip(names) {
            by_type.insert(descriptor.name.clone(), accessors.len());
            accessors.insert(
                names.accessor.clone(),
                Accessor::new(
                    descriptor.clone(),
                    names,
                    store.clone(),
                    Rc::clone(repository),
                ),
            );
        }
        Ok(Self { accessors, by_type })
    }

    /// Accessor for a registered type name.
    pub fn get(&self, type_name: &str) -> Result<&Accessor> {
        self.by_type
            .get(type_name)
            .and_then(|&index| self.accessors.get_index(index))
            .map(|(_, accessor)| accessor)
            .ok_or_else(|| ProjectionError::unknown_type(type_name))
    }

    /// Accessor by its PascalCase name.
    pub fn by_accessor_name(&self, name: &str) -> Result<&Accessor> {
        self.accessors
            .get(name)
            .ok_or_else(|| ProjectionError::UnknownAccessor {
                name: name.to_owned(),
            })
    }

    #[must_use]
    pub fn contains_type(&self, type_name: &str) -> bool {
        self.by_type.contains_key(type_name)
    }

    /// `(accessor name, accessor)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Accessor)> {
        self.accessors.iter().map(|(name, a)| (name.as_str(), a))
    }

    /// Registered type names in registration order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.accessors.values().map(Accessor::name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accessors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accessors.is_empty()
    }
}
