//! Actors for the lifecycle engine.
//!
//! ## Design Principles
//!
//! - **One actor per blueprint**: each worker owns the typed blueprint and
//!   its instance document, and nothing else touches them
//! - **Strict FIFO**: a worker handles one message at a time, in the order
//!   they were enqueued; STOP is an ordinary message
//! - **Failure isolation**: a failing operation marks the blueprint as
//!   errored and the worker keeps draining its mailbox
//!
//! ## Actor Types
//!
//! - `BlueprintWorker`: runs DAY0, DAY2 and STOP for one blueprint
//! - `BlueprintManager`: not an actor itself; maps ids to worker handles

mod framework;
pub mod manager;
pub mod worker;

pub use framework::{Actor, ActorContext, ActorError, ActorHandle, Message};
pub use manager::{BlueprintManager, ManagerError};
pub use worker::{
    BlueprintWorker, CallError, Reply, WorkerEnv, WorkerHandle, WorkerMessage, WorkerMessageType,
};
