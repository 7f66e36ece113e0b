//! Connection binding: a registry handle with the connection name fixed ahead of time.
//!
//! Framework glue that injects "a session for the business database" can hold
//! a [`ConnectionBinding`] instead of threading the name through every handler.

use crate::db::engine::Engine;
use crate::db::registry::ConnectionRegistry;
use crate::db::session::ScopedSession;
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use sqlx::PgConnection;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ConnectionBinding {
    registry: Arc<ConnectionRegistry>,
    name: String,
}

impl ConnectionBinding {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub async fn engine(&self) -> DbResult<Arc<Engine>> {
        self.registry.get_engine(Some(&self.name)).await
    }

    pub async fn session(&self) -> DbResult<ScopedSession> {
        self.registry.acquire_session(Some(&self.name)).await
    }

    pub async fn run<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        self.registry.run_in_session(Some(&self.name), f).await
    }

    pub async fn health_check(&self) -> DbResult<bool> {
        self.registry.health_check(Some(&self.name)).await
    }
}

impl ConnectionRegistry {
    /// Bind a connection name. The name is resolved on each call, so binding an
    /// unknown name only fails once it is used.
    pub fn bind(self: &Arc<Self>, name: impl Into<String>) -> ConnectionBinding {
        ConnectionBinding {
            registry: Arc::clone(self),
            name: name.into(),
        }
    }

    /// Bind the default connection.
    pub fn bind_default(self: &Arc<Self>) -> ConnectionBinding {
        let name = self.default_connection().to_string();
        self.bind(name)
    }
}
