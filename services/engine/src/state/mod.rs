//! Blueprint persistence.
//!
//! Every blueprint is stored as one JSON document (see
//! [`crate::blueprint::BlueprintInstance`]) keyed by its id:
//! - [`SqliteBlueprintStore`] for the service, WAL-mode SQLite on local disk
//! - [`MemoryBlueprintStore`] for tests and throwaway runs
//!
//! Workers write the document at every status transition, which is what
//! lets a restarted engine rebuild a worker from the store alone.

mod store;

pub use store::{BlueprintStore, MemoryBlueprintStore, SqliteBlueprintStore, StoreError};
