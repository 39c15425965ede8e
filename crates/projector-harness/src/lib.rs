#![forbid(unsafe_code)]

//! Test harness for Projector: an in-memory repository that honours the
//! [`EntityRepository`](projector_core::EntityRepository) contract, and a
//! recorder for observing delivered batches.

pub mod memory;
pub mod spy;

pub use memory::{MemoryRepository, RelationDef, RepositoryStats};
pub use spy::BatchRecorder;
