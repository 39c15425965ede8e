//! Change events as emitted by the repository and as seen by listeners.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::StorageKind;
use crate::record::{EntityId, RecordRef};

/// One entry of a repository batch, in wire shape.
///
/// The payload shape depends on the storage kind registered for the type,
/// never on the event itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub type_name: String,
    pub payload: Value,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(type_name: impl Into<String>, payload: Value) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
        }
    }
}

/// A mutation sent to the repository as part of a dispatched batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub type_name: String,
    pub payload: Value,
}

impl Message {
    #[must_use]
    pub fn new(type_name: impl Into<String>, payload: Value) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
        }
    }
}

/// A payload resolved against the storage kind of its type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedPayload {
    /// Records of a collection type.
    Collection {
        /// Records carried by the event (inserted or replaced).
        records: Vec<RecordRef>,
        /// Identities removed by the event.
        removed: Vec<EntityId>,
        /// Whether `records` is the complete content of the type.
        snapshot: bool,
    },
    /// The current record of a singleton type.
    Singleton(Option<RecordRef>),
}

impl TypedPayload {
    #[must_use]
    pub fn storage(&self) -> StorageKind {
        match self {
            Self::Collection { .. } => StorageKind::Collection,
            Self::Singleton(_) => StorageKind::Singleton,
        }
    }

    /// Collection records, or an empty slice for singletons.
    #[must_use]
    pub fn records(&self) -> &[RecordRef] {
        match self {
            Self::Collection { records, .. } => records,
            Self::Singleton(_) => &[],
        }
    }

    /// Singleton record, or `None` for collections.
    #[must_use]
    pub fn single(&self) -> Option<&RecordRef> {
        match self {
            Self::Singleton(record) => record.as_ref(),
            Self::Collection { .. } => None,
        }
    }
}

/// A change event after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEvent {
    pub type_name: String,
    pub payload: TypedPayload,
}
