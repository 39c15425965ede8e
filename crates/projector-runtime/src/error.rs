use projector_core::{EntityId, RepositoryError, TypeNameError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Errors surfaced to callers of the projection layer.
///
/// Data-shape problems inside delivered batches never appear here; they are
/// recorded as [`EventFault`]s.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("invalid type name: {0}")]
    InvalidTypeName(#[from] TypeNameError),

    #[error("type {name:?} is registered twice")]
    DuplicateType { name: String },

    #[error("types {first:?} and {second:?} both map to accessor {accessor}")]
    AccessorNameCollision {
        first: String,
        second: String,
        accessor: String,
    },

    #[error("type {name:?} is not registered in this binding set")]
    UnknownType { name: String },

    #[error("no accessor named {name:?}")]
    UnknownAccessor { name: String },

    #[error("scope is already attached")]
    AlreadyAttached,

    #[error("invalid data: {0}")]
    InvalidData(#[from] EventFault),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[cfg(feature = "config-file")]
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl ProjectionError {
    #[must_use]
    pub fn unknown_type(name: impl Into<String>) -> Self {
        Self::UnknownType { name: name.into() }
    }
}

/// Why one event of a batch could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventFault {
    #[error("{type_name}: record {index} has no valid identity in {id_field:?}")]
    MissingId {
        type_name: String,
        index: usize,
        id_field: String,
    },

    #[error("{type_name}: expected {expected}, found {found}")]
    InvalidPayload {
        type_name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{type_name}: entry {key} is neither a record nor null")]
    InvalidEntry { type_name: String, key: EntityId },
}

impl EventFault {
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::MissingId { type_name, .. }
            | Self::InvalidPayload { type_name, .. }
            | Self::InvalidEntry { type_name, .. } => type_name,
        }
    }
}

/// Short name of a JSON value's shape, for fault messages.
pub(crate) fn shape_of(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
