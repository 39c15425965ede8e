#![forbid(unsafe_code)]

//! Projection runtime: keeps per-type view state in step with an entity
//! repository and exposes it through generated accessor bindings.
//!
//! # Architecture
//!
//! ```text
//! repository ──batch──▶ Multiplexer ──transition──▶ ProjectionStore
//!                           │                            │
//!                           ▼                            ▼
//!                    ListenerRegistry          Accessor views (memoized)
//!                                              RelationViews (signature-cached)
//! ```
//!
//! A [`ProjectionScope`] mounts all of it for one consumer. Everything is
//! single-threaded; shared state is `Rc<RefCell<..>>` and callbacks run
//! synchronously inside the repository's emit call.

pub mod accessor;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod mount;
pub mod multiplexer;
mod normalize;
pub mod reactive;
pub mod relation;
pub mod store;

pub use accessor::{
    Accessor, AccessorOutput, BindingNames, BindingSet, DerivedView, validate_descriptors,
};
pub use config::{ProjectionConfig, ProjectionManifest};
pub use diagnostics::{BatchCounters, Diagnostics, FaultRecord};
pub use dispatch::{DispatchCallbacks, Dispatcher};
pub use error::{EventFault, ProjectionError, Result};
pub use listener::{
    BatchListener, EventListener, ListenerHandle, ListenerRegistry, ListenerSlot, TypeFilter,
};
pub use mount::ProjectionScope;
pub use multiplexer::{BatchReport, Multiplexer};
pub use reactive::{BindingScope, Memo, Observable, Subscription};
pub use relation::{RelationSignature, RelationViews};
pub use store::{IdMap, ProjectionState, ProjectionStore, StoreAction, StoreTransition, TypeSlot};
