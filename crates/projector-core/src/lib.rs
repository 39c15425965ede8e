#![forbid(unsafe_code)]

//! Core: entity identities, type descriptors, change events, and the
//! repository contract the projection layer consumes.

pub mod descriptor;
pub mod event;
pub mod record;
pub mod repository;

pub use descriptor::{StorageKind, TypeDescriptor, TypeNameError, pascal_case, validate_type_name};
pub use event::{ChangeEvent, Message, TypedEvent, TypedPayload};
pub use record::{EntityId, Record, RecordRef};
pub use repository::{
    BatchCallback, EntityRepository, RepositoryError, SubscribeOptions, SubscriptionId,
};
