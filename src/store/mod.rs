//! Persistence layer: SQLite-backed durable job queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{LEASE_EXPIRED_ERROR, LibSqlBackend};
pub use traits::JobStore;
