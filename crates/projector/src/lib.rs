#![forbid(unsafe_code)]

//! Projector public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for users.

pub use projector_core as core;
#[cfg(feature = "runtime")]
pub use projector_runtime as runtime;

pub mod prelude {
    pub use projector_core::{
        ChangeEvent, EntityId, EntityRepository, Message, Record, RecordRef, StorageKind,
        TypeDescriptor, TypedEvent, TypedPayload,
    };

    #[cfg(feature = "runtime")]
    pub use projector_runtime::{
        Accessor, AccessorOutput, DispatchCallbacks, ListenerHandle, ProjectionConfig,
        ProjectionError, ProjectionScope, StoreAction, TypeFilter,
    };
}
