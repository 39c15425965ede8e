#![forbid(unsafe_code)]

//! The Projection Store: one slot per registered type, rebuilt from events.
//!
//! # Design
//!
//! The store holds an immutable [`ProjectionState`] snapshot inside an
//! [`Observable`]. Writers stage slot replacements in a [`StoreTransition`]
//! and [`apply`](ProjectionStore::apply) it; all replacements land in one
//! new snapshot and subscribers are notified once. Slots are reference
//! counted, so an untouched slot keeps its pointer identity across
//! transitions and readers can memoize against its generation.
//!
//! # Invariants
//!
//! 1. One transition is one version bump and one notification, however many
//!    slots it replaces. An empty transition changes nothing.
//! 2. A replaced slot receives the new store generation; generations are
//!    never reused.
//! 3. A slot that is not part of a transition keeps its generation and its
//!    `Rc` identity.

use std::rc::Rc;

use ahash::AHashMap;
use projector_core::{EntityId, RecordRef, StorageKind, TypeDescriptor};
use serde_json::Value;

use crate::error::{ProjectionError, Result};
use crate::normalize::{SlotChange, normalize_replacement};
use crate::reactive::{Observable, Subscription};

/// Records of a collection slot, keyed by identity, in arrival order.
pub type IdMap = indexmap::IndexMap<EntityId, RecordRef, ahash::RandomState>;

/// Content of one type's slot.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSlot {
    Collection(Rc<IdMap>),
    Singleton(Option<RecordRef>),
}

impl TypeSlot {
    /// An empty slot of the given kind.
    #[must_use]
    pub fn empty(kind: StorageKind) -> Self {
        match kind {
            StorageKind::Collection => Self::Collection(Rc::default()),
            StorageKind::Singleton => Self::Singleton(None),
        }
    }

    #[must_use]
    pub fn storage(&self) -> StorageKind {
        match self {
            Self::Collection(_) => StorageKind::Collection,
            Self::Singleton(_) => StorageKind::Singleton,
        }
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Collection(map) => map.len(),
            Self::Singleton(record) => usize::from(record.is_some()),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct SlotEntry {
    slot: TypeSlot,
    generation: u64,
}

/// An immutable snapshot of every slot.
#[derive(Debug, Clone, Default)]
pub struct ProjectionState {
    slots: Rc<AHashMap<String, SlotEntry>>,
    generation: u64,
    changed: Rc<[String]>,
}

impl ProjectionState {
    #[must_use]
    pub fn slot(&self, type_name: &str) -> Option<&TypeSlot> {
        self.slots.get(type_name).map(|e| &e.slot)
    }

    /// Generation of the slot, or 0 if it was never written.
    #[must_use]
    pub fn slot_generation(&self, type_name: &str) -> u64 {
        self.slots.get(type_name).map_or(0, |e| e.generation)
    }

    /// Number of transitions applied so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Types replaced by the transition that produced this snapshot.
    #[must_use]
    pub fn changed_types(&self) -> &[String] {
        &self.changed
    }

    /// Number of slots ever written.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Slot replacements staged for one atomic update.
#[derive(Debug, Clone, Default)]
pub struct StoreTransition {
    updates: Vec<(String, TypeSlot)>,
}

impl StoreTransition {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `slot` as the new content of `type_name`. A later staging of
    /// the same type wins.
    pub fn set(&mut self, type_name: impl Into<String>, slot: TypeSlot) {
        let type_name = type_name.into();
        if let Some(existing) = self.updates.iter_mut().find(|(name, _)| *name == type_name) {
            existing.1 = slot;
        } else {
            self.updates.push((type_name, slot));
        }
    }

    /// The slot as it stands after the staged updates, falling back to
    /// `state`.
    #[must_use]
    pub fn current<'a>(
        &'a self,
        state: &'a ProjectionState,
        type_name: &str,
    ) -> Option<&'a TypeSlot> {
        self.updates
            .iter()
            .find(|(name, _)| name == type_name)
            .map(|(_, slot)| slot)
            .or_else(|| state.slot(type_name))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.updates.len()
    }
}

/// Reducer action accepted from a host state container.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    /// Replace a slot wholesale. Collections accept an array of records or
    /// an id map; singletons accept a record, `null`, or a short array.
    SetData { type_name: String, data: Value },
    /// Drop records from a collection slot. Ignored for singletons.
    RemoveData {
        type_name: String,
        ids: Vec<EntityId>,
    },
}

/// The per-scope Projection Store.
///
/// Cloning creates a new handle to the same store.
#[derive(Clone)]
pub struct ProjectionStore {
    state: Observable<ProjectionState>,
    descriptors: Rc<AHashMap<String, TypeDescriptor>>,
}

impl std::fmt::Debug for ProjectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.state.with(|state| {
            f.debug_struct("ProjectionStore")
                .field("generation", &state.generation)
                .field("slots", &state.slots.len())
                .field("types", &self.descriptors.len())
                .finish()
        })
    }
}

impl ProjectionStore {
    /// An empty store for the given types.
    #[must_use]
    pub fn new<'a>(descriptors: impl IntoIterator<Item = &'a TypeDescriptor>) -> Self {
        let descriptors = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();
        Self {
            state: Observable::new(ProjectionState::default()),
            descriptors: Rc::new(descriptors),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn state(&self) -> ProjectionState {
        self.state.get()
    }

    /// Current content of a slot. Registered types that were never written
    /// read as empty; unregistered types read as `None`.
    #[must_use]
    pub fn slot(&self, type_name: &str) -> Option<TypeSlot> {
        let descriptor = self.descriptors.get(type_name)?;
        Some(self.state.with(|state| {
            state
                .slot(type_name)
                .cloned()
                .unwrap_or_else(|| TypeSlot::empty(descriptor.storage))
        }))
    }

    #[must_use]
    pub fn slot_generation(&self, type_name: &str) -> u64 {
        self.state.with(|state| state.slot_generation(type_name))
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.with(ProjectionState::generation)
    }

    /// Number of records in a slot (0 for unknown types).
    #[must_use]
    pub fn len(&self, type_name: &str) -> usize {
        self.state
            .with(|state| state.slot(type_name).map_or(0, TypeSlot::len))
    }

    #[must_use]
    pub fn descriptor(&self, type_name: &str) -> Option<&TypeDescriptor> {
        self.descriptors.get(type_name)
    }

    /// Install every staged slot as one new snapshot and notify once.
    ///
    /// Returns the new store generation, or `None` for an empty transition.
    pub fn apply(&self, transition: StoreTransition) -> Option<u64> {
        if transition.is_empty() {
            return None;
        }
        let mut next = self.state.get();
        let generation = next.generation + 1;
        let slots = Rc::make_mut(&mut next.slots);
        let mut changed = Vec::with_capacity(transition.updates.len());
        for (type_name, slot) in transition.updates {
            slots.insert(type_name.clone(), SlotEntry { slot, generation });
            changed.push(type_name);
        }
        next.generation = generation;
        next.changed = changed.into();
        self.state.replace(next);
        Some(generation)
    }

    /// Empty every slot that holds records, in one transition. Returns the
    /// new generation, or `None` when the store was already empty.
    pub fn reset(&self) -> Option<u64> {
        let mut transition = StoreTransition::new();
        self.state.with(|state| {
            for (type_name, entry) in state.slots.iter() {
                if !entry.slot.is_empty() {
                    transition.set(type_name.clone(), TypeSlot::empty(entry.slot.storage()));
                }
            }
        });
        self.apply(transition)
    }

    /// Host-container bridge: apply a reducer action.
    pub fn reduce(&self, action: StoreAction) -> Result<()> {
        let mut transition = StoreTransition::new();
        match action {
            StoreAction::SetData { type_name, data } => {
                let descriptor = self
                    .descriptors
                    .get(&type_name)
                    .ok_or_else(|| ProjectionError::unknown_type(&type_name))?;
                let change = normalize_replacement(descriptor, &data)?;
                transition.set(type_name, change.apply(None));
            }
            StoreAction::RemoveData { type_name, ids } => {
                let descriptor = self
                    .descriptors
                    .get(&type_name)
                    .ok_or_else(|| ProjectionError::unknown_type(&type_name))?;
                if descriptor.is_singleton() {
                    return Ok(());
                }
                let current = self.slot(&type_name);
                let change = SlotChange::Delta {
                    upserts: Vec::new(),
                    removed: ids,
                };
                if change.is_noop(current.as_ref()) {
                    return Ok(());
                }
                transition.set(type_name, change.apply(current.as_ref()));
            }
        }
        self.apply(transition);
        Ok(())
    }

    /// Observe every applied transition.
    pub fn subscribe(&self, callback: impl Fn(&ProjectionState) + 'static) -> Subscription {
        self.state.subscribe(callback)
    }
}
