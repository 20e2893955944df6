//! `queue` crate: registry of long-running background tasks.
//!
//! The engine keeps exactly one poll task per `(run, node)` pair alive while
//! an external job is in flight.  Call sites only see the [`TaskRegistry`]
//! trait, so the local tokio implementation can be swapped for one backed by
//! a durable queue.

pub mod key;
pub mod registry;

pub use key::PollKey;
pub use registry::{LocalTaskRegistry, TaskRegistry};
