//! Entity type descriptors and the accessor-name transform.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default identity field for collection types.
pub const DEFAULT_ID_FIELD: &str = "id";

/// How a registered type stores its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Many records keyed by identity.
    Collection,
    /// At most one record, without identity.
    Singleton,
}

impl StorageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Singleton => "singleton",
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Type name as known to the repository.
    pub name: String,
    /// Storage kind declared for the type.
    pub storage: StorageKind,
    /// Identity field of collection records. Ignored for singletons.
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_id_field() -> String {
    DEFAULT_ID_FIELD.to_owned()
}

impl TypeDescriptor {
    /// Describe a collection type keyed by `"id"`.
    #[must_use]
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageKind::Collection,
            id_field: default_id_field(),
        }
    }

    /// Describe a singleton type.
    #[must_use]
    pub fn singleton(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageKind::Singleton,
            id_field: default_id_field(),
        }
    }

    /// Use a different identity field.
    #[must_use]
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.storage == StorageKind::Singleton
    }

    /// Accessor name derived from the type name.
    #[must_use]
    pub fn accessor_name(&self) -> String {
        pascal_case(&self.name)
    }
}

/// A type name outside the accepted alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeNameError {
    #[error("type name is empty")]
    Empty,
    #[error(
        "type name {name:?} contains {found:?}; only ASCII letters, digits and '_' are allowed"
    )]
    InvalidChar { name: String, found: char },
    #[error("type name {name:?} has no letters or digits")]
    NoWord { name: String },
}

/// Check that `name` only uses ASCII letters, digits and underscores.
pub fn validate_type_name(name: &str) -> Result<(), TypeNameError> {
    if name.is_empty() {
        return Err(TypeNameError::Empty);
    }
    if let Some(found) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(TypeNameError::InvalidChar {
            name: name.to_owned(),
            found,
        });
    }
    if !name.chars().any(|c| c.is_ascii_alphanumeric()) {
        return Err(TypeNameError::NoWord {
            name: name.to_owned(),
        });
    }
    Ok(())
}

/// Fold a snake_case type name into PascalCase.
///
/// Each `_`-separated segment gets its first character uppercased and the
/// rest lowercased; empty segments vanish.
#[must_use]
pub fn pascal_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for segment in name.split('_').filter(|s| !s.is_empty()) {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars.map(|c| c.to_ascii_lowercase()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pascal_case_examples() {
        assert_eq!(pascal_case("user"), "User");
        assert_eq!(pascal_case("user_profile"), "UserProfile");
        assert_eq!(pascal_case("API_key"), "ApiKey");
        assert_eq!(pascal_case("user__x"), "UserX");
        assert_eq!(pascal_case("_leading"), "Leading");
        assert_eq!(pascal_case("v2_item"), "V2Item");
        assert_eq!(pascal_case("1st_place"), "1stPlace");
    }

    #[test]
    fn validation() {
        assert!(validate_type_name("user_profile").is_ok());
        assert!(validate_type_name("v2").is_ok());
        assert_eq!(validate_type_name(""), Err(TypeNameError::Empty));
        assert!(matches!(
            validate_type_name("user-profile"),
            Err(TypeNameError::InvalidChar { found: '-', .. })
        ));
        assert!(matches!(
            validate_type_name("___"),
            Err(TypeNameError::NoWord { .. })
        ));
    }

    #[test]
    fn storage_kind_serde_is_lowercase() {
        let d: TypeDescriptor =
            serde_json::from_str(r#"{"name":"session","storage":"singleton"}"#).unwrap();
        assert_eq!(d, TypeDescriptor::singleton("session"));
        assert_eq!(d.id_field, "id");
    }

    proptest! {
        #[test]
        fn pascal_case_is_total_and_alphanumeric(name in "[A-Za-z0-9_]{1,24}") {
            let folded = pascal_case(&name);
            prop_assert!(folded.chars().all(|c| c.is_ascii_alphanumeric()));
            let word_chars = name.chars().filter(|c| *c != '_').count();
            prop_assert_eq!(folded.len(), word_chars);
        }

        #[test]
        fn pascal_case_is_idempotent_on_words(name in "[a-z][a-z0-9]{0,12}") {
            let once = pascal_case(&name);
            prop_assert_eq!(pascal_case(&once), once.clone());
        }
    }
}
