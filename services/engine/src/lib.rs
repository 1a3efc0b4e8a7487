//! Blueprint Lifecycle Engine Library
//!
//! Drives declaratively described infrastructure ("blueprints": VMs,
//! networks and their configuration) through DAY0 provisioning, DAY2
//! reconfiguration and teardown, against per-area virtualization providers.
//!
//! ## Architecture
//!
//! ```text
//! BlueprintManager
//! ├── BlueprintWorker(id)   (one FIFO actor per blueprint)
//! │   ├── Blueprint         (typed lifecycle callbacks + state)
//! │   └── BlueprintContext  (registry, store, providers, children)
//! └── ProviderRegistry
//!     └── VirtualizationProvider(area)
//! ```
//!
//! ## Modules
//!
//! - `actors`: actor framework, blueprint worker and manager
//! - `blueprint`: blueprint trait, context, instance document, type registry
//! - `blueprints`: built-in blueprint types
//! - `provider`: virtualization providers and their collaborators
//! - `state`: blueprint persistence

pub mod actors;
pub mod blueprint;
pub mod blueprints;
pub mod cancel;
pub mod config;
pub mod events;
pub mod provider;
pub mod resources;
pub mod state;

pub use actors::{BlueprintManager, ManagerError};
pub use blueprint::{Blueprint, BlueprintContext, BlueprintError, BlueprintType, BlueprintTypeRegistry};
