//! Request handlers, one module per resource.

pub mod events;
pub mod health;
pub mod pipelines;
pub mod polling;
pub mod runs;
pub mod webhooks;
