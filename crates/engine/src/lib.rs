//! `engine` crate: domain models, DAG validation, and the run engine.

pub mod config;
pub mod controller;
pub mod dag;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod readiness;
pub mod tracker;

pub use config::EngineConfig;
pub use controller::RunController;
pub use dag::{topological_order, validate_structure};
pub use error::EngineError;
pub use events::{EventBus, RunEvent, RunEventKind, Subscription, SubscriptionHandle, Topic};
pub use executor::NodeRegistry;
pub use models::{Edge, Node, NodeType, Pipeline, PipelineDefinition, RunDetails};
pub use readiness::ready_nodes;
pub use tracker::{PollingStatus, WebhookOutcome};

#[cfg(test)]
mod controller_tests;
