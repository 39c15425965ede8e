//! Records and their identities.
//!
//! A [`Record`] is an untyped JSON document. Identity is carried by an
//! [`EntityId`], which stores the canonical string form of the identity value
//! so that the number `1` and the string `"1"` address the same record. This
//! matches how identity maps are keyed in the wire format (JSON object keys
//! are always strings).

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An untyped entity record.
pub type Record = Value;

/// A shared, immutable record as held by projection slots.
pub type RecordRef = Rc<Record>;

/// Identity of a record within a collection type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create an identity from its canonical string form.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity carried by a JSON value, if the value can act as one.
    ///
    /// Numbers and strings are identities; every other shape is not.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Read the identity stored under `id_field` of a record.
    #[must_use]
    pub fn of_record(record: &Record, id_field: &str) -> Option<Self> {
        record.get(id_field).and_then(Self::from_value)
    }

    /// Canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the canonical string form.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

macro_rules! entity_id_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for EntityId {
                fn from(n: $t) -> Self {
                    Self(n.to_string())
                }
            }
        )*
    };
}

entity_id_from_int!(i32, i64, u32, u64, usize);

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
