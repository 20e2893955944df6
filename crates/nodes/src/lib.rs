//! `nodes` crate: the `ExecutableNode` trait and built-in node implementations.
//!
//! Every node kind a pipeline can contain implements [`ExecutableNode`].
//! The engine crate dispatches execution through this trait object and
//! decides what to do with the returned [`NodeOutcome`].

pub mod condition;
pub mod error;
pub mod expr;
pub mod job;
pub mod mock;
pub mod passthrough;
pub mod traits;

pub use condition::ConditionNode;
pub use error::NodeError;
pub use job::{JobDefaults, JobNode};
pub use passthrough::PassThroughNode;
pub use traits::{ExecutableNode, ExecutionContext, NodeOutcome};
