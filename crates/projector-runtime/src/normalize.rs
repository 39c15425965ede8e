//! Payload normalization at the multiplexer boundary.
//!
//! A raw payload is resolved once, against the storage kind registered for
//! its type, into a [`SlotChange`]. Everything downstream branches on the
//! change variant, never on the JSON shape.
//!
//! | kind       | payload  | result                                    |
//! |------------|----------|-------------------------------------------|
//! | collection | array    | snapshot keyed by `id_field`              |
//! | collection | object   | keyed delta, `null` removes               |
//! | collection | null     | empty snapshot                            |
//! | singleton  | object   | that record                               |
//! | singleton  | null     | none                                      |
//! | singleton  | array    | first element (object or null), or none   |
//!
//! Every other combination is an [`EventFault`].

use std::rc::Rc;

use projector_core::{EntityId, RecordRef, StorageKind, TypeDescriptor, TypedPayload};
use serde_json::Value;

use crate::error::{EventFault, shape_of};
use crate::store::{IdMap, TypeSlot};

/// A normalized change to one slot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SlotChange {
    /// Replace the collection with exactly these records.
    Snapshot(IdMap),
    /// Upsert and remove individual records.
    Delta {
        upserts: Vec<(EntityId, RecordRef)>,
        removed: Vec<EntityId>,
    },
    /// Replace the singleton record.
    Single(Option<RecordRef>),
}

impl SlotChange {
    /// Listener-facing form of this change.
    pub(crate) fn to_typed(&self) -> TypedPayload {
        match self {
            Self::Snapshot(map) => TypedPayload::Collection {
                records: map.values().cloned().collect(),
                removed: Vec::new(),
                snapshot: true,
            },
            Self::Delta { upserts, removed } => TypedPayload::Collection {
                records: upserts.iter().map(|(_, r)| Rc::clone(r)).collect(),
                removed: removed.clone(),
                snapshot: false,
            },
            Self::Single(record) => TypedPayload::Singleton(record.clone()),
        }
    }

    /// Whether applying this change to `current` would leave it as it is:
    /// a delta with no upserts whose removed ids are all absent.
    pub(crate) fn is_noop(&self, current: Option<&TypeSlot>) -> bool {
        let Self::Delta { upserts, removed } = self else {
            return false;
        };
        upserts.is_empty()
            && removed.iter().all(|id| match current {
                Some(TypeSlot::Collection(map)) => !map.contains_key(id),
                _ => true,
            })
    }

    /// The slot that results from applying this change to `current`.
    pub(crate) fn apply(&self, current: Option<&TypeSlot>) -> TypeSlot {
        match self {
            Self::Snapshot(map) => TypeSlot::Collection(Rc::new(map.clone())),
            Self::Delta { upserts, removed } => {
                let mut map = match current {
                    Some(TypeSlot::Collection(existing)) => IdMap::clone(existing),
                    _ => IdMap::default(),
                };
                for id in removed {
                    map.shift_remove(id);
                }
                for (id, record) in upserts {
                    map.insert(id.clone(), Rc::clone(record));
                }
                TypeSlot::Collection(Rc::new(map))
            }
            Self::Single(record) => TypeSlot::Singleton(record.clone()),
        }
    }
}

/// Resolve an event payload for `descriptor`.
pub(crate) fn normalize_event(
    descriptor: &TypeDescriptor,
    payload: &Value,
) -> Result<SlotChange, EventFault> {
    match descriptor.storage {
        StorageKind::Collection => match payload {
            Value::Array(items) => {
                snapshot_from_array(descriptor, items).map(SlotChange::Snapshot)
            }
            Value::Object(entries) => {
                let mut upserts = Vec::new();
                let mut removed = Vec::new();
                for (key, value) in entries {
                    let id = EntityId::from(key.as_str());
                    match value {
                        Value::Null => removed.push(id),
                        Value::Object(_) => upserts.push((id, Rc::new(value.clone()))),
                        _ => {
                            return Err(EventFault::InvalidEntry {
                                type_name: descriptor.name.clone(),
                                key: id,
                            });
                        }
                    }
                }
                Ok(SlotChange::Delta { upserts, removed })
            }
            Value::Null => Ok(SlotChange::Snapshot(IdMap::default())),
            other => Err(EventFault::InvalidPayload {
                type_name: descriptor.name.clone(),
                expected: "array, object or null",
                found: shape_of(other),
            }),
        },
        StorageKind::Singleton => normalize_single(descriptor, payload).map(SlotChange::Single),
    }
}

/// Resolve a wholesale slot replacement for `descriptor`.
///
/// Unlike events, an object payload for a collection is an id map that
/// replaces the slot; `null` entries are skipped.
pub(crate) fn normalize_replacement(
    descriptor: &TypeDescriptor,
    data: &Value,
) -> Result<SlotChange, EventFault> {
    match (descriptor.storage, data) {
        (StorageKind::Collection, Value::Object(entries)) => {
            let mut map = IdMap::default();
            for (key, value) in entries {
                match value {
                    Value::Null => {}
                    Value::Object(_) => {
                        map.insert(EntityId::from(key.as_str()), Rc::new(value.clone()));
                    }
                    _ => {
                        return Err(EventFault::InvalidEntry {
                            type_name: descriptor.name.clone(),
                            key: EntityId::from(key.as_str()),
                        });
                    }
                }
            }
            Ok(SlotChange::Snapshot(map))
        }
        _ => normalize_event(descriptor, data),
    }
}

fn snapshot_from_array(
    descriptor: &TypeDescriptor,
    items: &[Value],
) -> Result<IdMap, EventFault> {
    let mut map = IdMap::with_capacity_and_hasher(items.len(), Default::default());
    for (index, item) in items.iter().enumerate() {
        let id = match item {
            Value::Object(_) => EntityId::of_record(item, &descriptor.id_field),
            _ => None,
        }
        .ok_or_else(|| EventFault::MissingId {
            type_name: descriptor.name.clone(),
            index,
            id_field: descriptor.id_field.clone(),
        })?;
        map.insert(id, Rc::new(item.clone()));
    }
    Ok(map)
}

fn normalize_single(
    descriptor: &TypeDescriptor,
    payload: &Value,
) -> Result<Option<RecordRef>, EventFault> {
    let invalid = |found: &Value| EventFault::InvalidPayload {
        type_name: descriptor.name.clone(),
        expected: "object, null, or array of at most one object",
        found: shape_of(found),
    };
    match payload {
        Value::Null => Ok(None),
        Value::Object(_) => Ok(Some(Rc::new(payload.clone()))),
        Value::Array(items) => match items.first() {
            None | Some(Value::Null) => Ok(None),
            Some(first @ Value::Object(_)) => Ok(Some(Rc::new(first.clone()))),
            Some(other) => Err(invalid(other)),
        },
        other => Err(invalid(other)),
    }
}
