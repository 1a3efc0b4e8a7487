//! # lcm-id
//!
//! Typed identifiers for the blueprint lifecycle engine.
//!
//! Every identifier is `{prefix}_{ulid}`:
//!
//! - `bp_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a blueprint instance
//! - `res_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a resource owned by a blueprint
//!
//! The prefix keeps a resource id from being handed to an API that expects a
//! blueprint id, and the ULID keeps ids sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
