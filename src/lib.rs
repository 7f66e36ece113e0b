//! pg-multi
//!
//! Named PostgreSQL connections configured through `DB_*` environment
//! variables, with one lazily built pool per name, scoped sessions that commit
//! on success and roll back on failure, and administrative helpers that
//! create, drop and list databases through a superuser connection.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod settings;

pub use db::{ConnectionBinding, ConnectionRegistry, Engine, ScopedSession, startup};
pub use error::{DbError, DbResult};
pub use models::ConnectionConfig;
pub use settings::DatabaseSettings;
