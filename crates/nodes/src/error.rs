//! Node-level error type.

use thiserror::Error;

use crate::expr::ExprError;

/// Errors returned by a node's `execute` method.
///
/// Every variant is fatal for the node: the engine marks it failed and the
/// run fails with it.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node's `config` is unusable.
    #[error("invalid node config: {0}")]
    InvalidConfig(String),

    /// The external job could not be submitted.
    #[error("job submission failed: {0}")]
    Dispatch(#[from] jobboard::JobBoardError),

    /// A condition expression could not be parsed or evaluated.
    #[error("condition error: {0}")]
    Expression(#[from] ExprError),

    /// Anything else a node implementation wants to report.
    #[error("{0}")]
    Other(String),
}
