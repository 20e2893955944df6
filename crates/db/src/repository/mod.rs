//! Repository functions: one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic and no domain types, just SQL.

pub mod node_runs;
pub mod pipelines;
pub mod runs;

use std::str::FromStr;

use crate::DbError;

/// Parse a status column stored as text.
pub(crate) fn parse_status<T>(raw: &str) -> Result<T, DbError>
where
    T: FromStr<Err = String>,
{
    raw.parse().map_err(DbError::Corrupt)
}
