//! # lcm-events
//!
//! Events published by blueprint workers and the outcome records returned to
//! callers.
//!
//! ## Event vocabulary
//!
//! One event per lifecycle phase transition:
//!
//! ```text
//! DAY0:  started_day0 -> created | error
//! DAY2:  started_day2 -> end_day2 | error
//! STOP:  start_teardown -> deleted
//! ```
//!
//! Every event carries a snapshot of the blueprint status at the time it was
//! emitted, so a subscriber never needs to read the store to render progress.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
