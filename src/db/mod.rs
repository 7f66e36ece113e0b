//! Database layer.
//!
//! This module provides:
//! - The connection registry with lazily built, cached engines
//! - Pooled engines, one per connection name
//! - Scoped sessions with commit/rollback-on-exit semantics
//! - Administrative database operations over transient connections
//! - Name bindings for framework glue

pub mod admin;
pub mod binding;
pub mod engine;
pub mod registry;
pub mod session;

pub use admin::{AdminOperation, quote_ident};
pub use binding::ConnectionBinding;
pub use engine::Engine;
pub use registry::{ConnectionRegistry, startup};
pub use session::ScopedSession;
