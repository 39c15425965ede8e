//! In-memory [`EntityRepository`] for tests.
//!
//! # Semantics
//!
//! - Collection patches are either an array of records (each must carry its
//!   identity) or an object keyed by identity where `null` deletes. Fields
//!   are shallow-merged into existing records, last write wins.
//! - Singleton patches are an object (shallow-merged) or `null` (clears).
//! - Every successful merge emits one batch. Collection payloads are the
//!   full record array of the type; singleton payloads are the record or
//!   `null`, or a one-element array when
//!   [`singletons_as_arrays`](MemoryRepository::singletons_as_arrays) is set.
//! - Patches are applied to a copy and committed only when the whole patch
//!   (or dispatched batch) is valid.
//!
//! Subscriber callbacks run after every internal borrow is released, so
//! callbacks may re-enter the repository.

use std::cell::RefCell;

use indexmap::IndexMap;
use projector_core::{
    BatchCallback, ChangeEvent, EntityId, EntityRepository, Message, Record, RepositoryError,
    StorageKind, SubscribeOptions, SubscriptionId, TypeDescriptor,
};
use serde_json::{Map, Value};

type Records = IndexMap<EntityId, Record, ahash::RandomState>;

/// A relation from records of `source_type` to records of `target_type`.
///
/// A target record is related when its `target_field` holds the same
/// identity as the source record's `source_field`. When the source field is
/// an array, any element may match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub source_type: String,
    pub target_type: String,
    pub source_field: String,
    pub target_field: String,
}

/// Counters for assertions about repository traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub merges: u64,
    pub dispatches: u64,
    pub batches_emitted: u64,
    pub subscribes: u64,
    pub unsubscribes: u64,
    pub related_queries: u64,
    pub full_related_queries: u64,
}

#[derive(Debug, Clone)]
struct TypeState {
    descriptor: TypeDescriptor,
    records: Records,
    single: Option<Record>,
}

impl TypeState {
    fn new(descriptor: TypeDescriptor) -> Self {
        Self {
            descriptor,
            records: Records::default(),
            single: None,
        }
    }

    fn all(&self) -> Vec<Record> {
        match self.descriptor.storage {
            StorageKind::Collection => self.records.values().cloned().collect(),
            StorageKind::Singleton => self.single.iter().cloned().collect(),
        }
    }
}

struct Subscriber {
    id: SubscriptionId,
    options: SubscribeOptions,
    callback: BatchCallback,
}

#[derive(Default)]
struct Inner {
    types: IndexMap<String, TypeState>,
    relations: Vec<RelationDef>,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
    stats: RepositoryStats,
}

/// Single-threaded in-memory repository.
#[derive(Default)]
pub struct MemoryRepository {
    inner: RefCell<Inner>,
    singletons_as_arrays: bool,
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("MemoryRepository")
            .field("types", &inner.types.keys().collect::<Vec<_>>())
            .field("subscribers", &inner.subscribers.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit singleton payloads as arrays of length 0 or 1.
    #[must_use]
    pub fn singletons_as_arrays(mut self) -> Self {
        self.singletons_as_arrays = true;
        self
    }

    /// Register a type. Re-registering replaces the descriptor and drops
    /// existing records.
    pub fn register(&self, descriptor: TypeDescriptor) {
        let name = descriptor.name.clone();
        self.inner
            .borrow_mut()
            .types
            .insert(name, TypeState::new(descriptor));
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_type(self, descriptor: TypeDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// Define a relation between two types.
    pub fn relate(
        &self,
        source_type: impl Into<String>,
        target_type: impl Into<String>,
        source_field: impl Into<String>,
        target_field: impl Into<String>,
    ) {
        self.inner.borrow_mut().relations.push(RelationDef {
            source_type: source_type.into(),
            target_type: target_type.into(),
            source_field: source_field.into(),
            target_field: target_field.into(),
        });
    }

    /// Deliver `events` to matching subscribers verbatim.
    ///
    /// Tests use this to inject batches the merge path would never produce
    /// (unregistered types, malformed payloads).
    pub fn emit(&self, events: Vec<ChangeEvent>) {
        let targets: Vec<(SubscribeOptions, BatchCallback)> = {
            let mut inner = self.inner.borrow_mut();
            inner.stats.batches_emitted += 1;
            inner
                .subscribers
                .iter()
                .map(|s| (s.options.clone(), s.callback.clone()))
                .collect()
        };
        for (options, callback) in targets {
            let filtered: Vec<ChangeEvent> = events
                .iter()
                .filter(|e| options.accepts(&e.type_name))
                .cloned()
                .collect();
            if !filtered.is_empty() {
                callback(&filtered);
            }
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn live_subscriptions(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    #[must_use]
    pub fn stats(&self) -> RepositoryStats {
        self.inner.borrow().stats
    }

    fn payload_for(&self, state: &TypeState) -> Value {
        match state.descriptor.storage {
            StorageKind::Collection => Value::Array(state.records.values().cloned().collect()),
            StorageKind::Singleton => match (&state.single, self.singletons_as_arrays) {
                (Some(record), true) => Value::Array(vec![record.clone()]),
                (None, true) => Value::Array(Vec::new()),
                (Some(record), false) => record.clone(),
                (None, false) => Value::Null,
            },
        }
    }

    fn is_related(source: &Record, def: &RelationDef, target: &Record) -> bool {
        let Some(target_id) = target.get(&def.target_field).and_then(EntityId::from_value) else {
            return false;
        };
        match source.get(&def.source_field) {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(EntityId::from_value)
                .any(|id| id == target_id),
            Some(value) => EntityId::from_value(value).is_some_and(|id| id == target_id),
            None => false,
        }
    }

    fn related_in(
        inner: &Inner,
        source_type: &str,
        source: &Record,
        target_type: &str,
    ) -> Result<Vec<Record>, RepositoryError> {
        let def = inner
            .relations
            .iter()
            .find(|d| d.source_type == source_type && d.target_type == target_type)
            .ok_or_else(|| RepositoryError::RelationNotDefined {
                source_type: source_type.to_owned(),
                target_type: target_type.to_owned(),
            })?;
        let target = state_of(inner, target_type)?;
        Ok(target
            .all()
            .into_iter()
            .filter(|r| Self::is_related(source, def, r))
            .collect())
    }

    fn with_related(inner: &Inner, type_name: &str, record: &Record) -> Record {
        let mut out = record.clone();
        if let Value::Object(map) = &mut out {
            for def in inner.relations.iter().filter(|d| d.source_type == type_name) {
                let related = Self::related_in(inner, type_name, record, &def.target_type)
                    .unwrap_or_default();
                map.insert(def.target_type.clone(), Value::Array(related));
            }
        }
        out
    }
}

fn state_of<'a>(inner: &'a Inner, type_name: &str) -> Result<&'a TypeState, RepositoryError> {
    inner
        .types
        .get(type_name)
        .ok_or_else(|| RepositoryError::UnknownType {
            type_name: type_name.to_owned(),
        })
}

fn invalid(type_name: &str, reason: impl Into<String>) -> RepositoryError {
    RepositoryError::InvalidPatch {
        type_name: type_name.to_owned(),
        reason: reason.into(),
    }
}

/// Shallow-merge `patch` into `base`; non-object bases are replaced.
fn merge_fields(base: Option<&Record>, patch: &Map<String, Value>) -> Record {
    let mut merged = match base {
        Some(Value::Object(existing)) => existing.clone(),
        _ => Map::new(),
    };
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

/// Identity value to store in a record created from a keyed patch entry.
fn id_value_for_key(key: &str) -> Value {
    key.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(key.to_owned()))
}

/// Apply `patch` to `state`, returning the affected records post-merge.
fn apply_patch(state: &mut TypeState, patch: &Value) -> Result<Vec<Record>, RepositoryError> {
    let name = state.descriptor.name.clone();
    match state.descriptor.storage {
        StorageKind::Collection => {
            let id_field = state.descriptor.id_field.clone();
            let mut next = state.records.clone();
            let mut affected = Vec::new();
            match patch {
                Value::Array(items) => {
                    for (index, item) in items.iter().enumerate() {
                        let Value::Object(fields) = item else {
                            return Err(invalid(&name, format!("element {index} is not an object")));
                        };
                        let id = EntityId::of_record(item, &id_field).ok_or_else(|| {
                            invalid(&name, format!("element {index} has no {id_field:?}"))
                        })?;
                        let merged = merge_fields(next.get(&id), fields);
                        next.insert(id, merged.clone());
                        affected.push(merged);
                    }
                }
                Value::Object(entries) => {
                    for (key, value) in entries {
                        let id = EntityId::from(key.as_str());
                        match value {
                            Value::Null => {
                                next.shift_remove(&id);
                            }
                            Value::Object(fields) => {
                                let mut merged = merge_fields(next.get(&id), fields);
                                if let Value::Object(map) = &mut merged {
                                    map.entry(id_field.clone())
                                        .or_insert_with(|| id_value_for_key(key));
                                }
                                next.insert(id, merged.clone());
                                affected.push(merged);
                            }
                            _ => {
                                return Err(invalid(
                                    &name,
                                    format!("entry {key:?} is not an object"),
                                ));
                            }
                        }
                    }
                }
                Value::Null => next.clear(),
                other => return Err(invalid(&name, format!("unsupported patch shape {other}"))),
            }
            state.records = next;
            Ok(affected)
        }
        StorageKind::Singleton => {
            let next = match patch {
                Value::Null => None,
                Value::Object(fields) => Some(merge_fields(state.single.as_ref(), fields)),
                Value::Array(items) => match items.first() {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(fields)) => {
                        Some(merge_fields(state.single.as_ref(), fields))
                    }
                    Some(_) => return Err(invalid(&name, "array element is not an object")),
                },
                other => return Err(invalid(&name, format!("unsupported patch shape {other}"))),
            };
            state.single = next;
            Ok(state.single.iter().cloned().collect())
        }
    }
}

impl EntityRepository for MemoryRepository {
    fn storage_kind(&self, type_name: &str) -> Option<StorageKind> {
        self.inner
            .borrow()
            .types
            .get(type_name)
            .map(|s| s.descriptor.storage)
    }

    fn merge_data(&self, type_name: &str, patch: Value) -> Result<Vec<Record>, RepositoryError> {
        let (affected, event) = {
            let mut inner = self.inner.borrow_mut();
            inner.stats.merges += 1;
            let state = inner
                .types
                .get_mut(type_name)
                .ok_or_else(|| RepositoryError::UnknownType {
                    type_name: type_name.to_owned(),
                })?;
            let affected = apply_patch(state, &patch)?;
            let payload = self.payload_for(state);
            (affected, ChangeEvent::new(type_name, payload))
        };
        tracing::trace!(message = "memory_repository.merge", type_name, affected = affected.len());
        self.emit(vec![event]);
        Ok(affected)
    }

    fn find_by_id(&self, type_name: &str, id: &EntityId) -> Option<Record> {
        let inner = self.inner.borrow();
        let state = inner.types.get(type_name)?;
        match state.descriptor.storage {
            StorageKind::Collection => state.records.get(id).cloned(),
            StorageKind::Singleton => None,
        }
    }

    fn find_all(&self, type_name: &str) -> Vec<Record> {
        self.inner
            .borrow()
            .types
            .get(type_name)
            .map(TypeState::all)
            .unwrap_or_default()
    }

    fn get_related(
        &self,
        source_type: &str,
        id: &EntityId,
        target_type: &str,
    ) -> Result<Vec<Record>, RepositoryError> {
        let mut inner = self.inner.borrow_mut();
        inner.stats.related_queries += 1;
        let source_state = state_of(&inner, source_type)?;
        let source = match source_state.descriptor.storage {
            StorageKind::Collection => source_state.records.get(id).cloned(),
            StorageKind::Singleton => source_state.single.clone(),
        }
        .ok_or_else(|| RepositoryError::NotFound {
            type_name: source_type.to_owned(),
            id: id.clone(),
        })?;
        Self::related_in(&inner, source_type, &source, target_type)
    }

    fn get_full_related_data(
        &self,
        type_name: &str,
        id: Option<&EntityId>,
    ) -> Result<Value, RepositoryError> {
        let mut inner = self.inner.borrow_mut();
        inner.stats.full_related_queries += 1;
        let state = state_of(&inner, type_name)?;
        match (state.descriptor.storage, id) {
            (StorageKind::Collection, Some(id)) => {
                let record = state.records.get(id).ok_or_else(|| RepositoryError::NotFound {
                    type_name: type_name.to_owned(),
                    id: id.clone(),
                })?;
                Ok(Self::with_related(&inner, type_name, record))
            }
            (StorageKind::Collection, None) => Ok(Value::Array(
                state
                    .records
                    .values()
                    .map(|r| Self::with_related(&inner, type_name, r))
                    .collect(),
            )),
            (StorageKind::Singleton, _) => Ok(state
                .single
                .as_ref()
                .map(|r| Self::with_related(&inner, type_name, r))
                .unwrap_or(Value::Null)),
        }
    }

    fn subscribe(&self, callback: BatchCallback, options: SubscribeOptions) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        inner.next_subscription += 1;
        inner.stats.subscribes += 1;
        let id = SubscriptionId(inner.next_subscription);
        inner.subscribers.push(Subscriber {
            id,
            options,
            callback,
        });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        let removed = inner.subscribers.len() != before;
        if removed {
            inner.stats.unsubscribes += 1;
        }
        removed
    }

    fn dispatch_batch(&self, messages: Vec<Message>) -> Result<(), RepositoryError> {
        let events = {
            let mut inner = self.inner.borrow_mut();
            inner.stats.dispatches += 1;
            let mut staged = inner.types.clone();
            let mut touched: Vec<String> = Vec::new();
            for message in &messages {
                let state = staged.get_mut(&message.type_name).ok_or_else(|| {
                    RepositoryError::UnknownType {
                        type_name: message.type_name.clone(),
                    }
                })?;
                apply_patch(state, &message.payload)?;
                if !touched.contains(&message.type_name) {
                    touched.push(message.type_name.clone());
                }
            }
            inner.types = staged;
            touched
                .iter()
                .filter_map(|name| {
                    inner
                        .types
                        .get(name)
                        .map(|state| ChangeEvent::new(name.clone(), self.payload_for(state)))
                })
                .collect::<Vec<_>>()
        };
        if !events.is_empty() {
            self.emit(events);
        }
        Ok(())
    }
}
