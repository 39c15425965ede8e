//! The entity repository contract.
//!
//! The repository owns registration, identity-keyed storage, relation graphs
//! and merge semantics. The projection layer only calls the operations below
//! and consumes the batches pushed to its subscription callback.
//!
//! Everything here is single-threaded: implementations use interior
//! mutability behind `&self` and are shared as `Rc<dyn EntityRepository>`.
//! Implementations must not hold internal borrows while invoking subscriber
//! callbacks, since callbacks may read from or write to the repository.

use std::rc::Rc;

use serde_json::Value;
use thiserror::Error;

use crate::descriptor::StorageKind;
use crate::event::{ChangeEvent, Message};
use crate::record::{EntityId, Record};

/// Handle returned by [`EntityRepository::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Callback receiving one ordered batch of change events.
pub type BatchCallback = Rc<dyn Fn(&[ChangeEvent])>;

/// Options for [`EntityRepository::subscribe`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Restrict delivery to these types. `None` delivers every type.
    pub types: Option<Vec<String>>,
}

impl SubscribeOptions {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: Some(types.into_iter().map(Into::into).collect()),
        }
    }

    /// Whether events of `type_name` pass this filter.
    #[must_use]
    pub fn accepts(&self, type_name: &str) -> bool {
        self.types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == type_name))
    }
}

/// Errors reported by a repository.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("type {type_name:?} is not registered")]
    UnknownType { type_name: String },

    #[error("{type_name} {id} not found")]
    NotFound { type_name: String, id: EntityId },

    #[error("no relation defined from {source_type} to {target_type}")]
    RelationNotDefined {
        source_type: String,
        target_type: String,
    },

    #[error("invalid patch for {type_name}: {reason}")]
    InvalidPatch { type_name: String, reason: String },
}

/// Operations the projection layer consumes from the repository.
pub trait EntityRepository {
    /// Storage kind registered for `type_name`.
    fn storage_kind(&self, type_name: &str) -> Option<StorageKind>;

    /// Merge `patch` into the records of `type_name`.
    ///
    /// Returns the affected records as they stand after the merge. Emits one
    /// batch to subscribers.
    fn merge_data(&self, type_name: &str, patch: Value) -> Result<Vec<Record>, RepositoryError>;

    fn find_by_id(&self, type_name: &str, id: &EntityId) -> Option<Record>;

    fn find_all(&self, type_name: &str) -> Vec<Record>;

    /// Records of `target_type` related to record `id` of `source_type`.
    fn get_related(
        &self,
        source_type: &str,
        id: &EntityId,
        target_type: &str,
    ) -> Result<Vec<Record>, RepositoryError>;

    /// Records of `type_name` (one, or all when `id` is `None`) with their
    /// related records embedded.
    fn get_full_related_data(
        &self,
        type_name: &str,
        id: Option<&EntityId>,
    ) -> Result<Value, RepositoryError>;

    fn subscribe(&self, callback: BatchCallback, options: SubscribeOptions) -> SubscriptionId;

    /// Remove a subscription. Returns `false` if the handle was not live.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Apply heterogeneous messages as one batch; emits one batch of events.
    fn dispatch_batch(&self, messages: Vec<Message>) -> Result<(), RepositoryError>;
}
