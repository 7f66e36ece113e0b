//! Data models.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;

// Re-export commonly used types
pub use connection::{ConnectionConfig, ConnectionConfigError, ConnectionSummary};
