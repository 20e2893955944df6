//! `db` crate: pure persistence layer.
//!
//! Provides the [`Store`] contract the engine runs against, typed row
//! structs, a Postgres connection pool with repository functions for every
//! table, and an in-memory store for tests and single-process use.  No
//! business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pool::DbPool;
pub use store::{PgStore, Store};
