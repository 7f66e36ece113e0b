//! Pooled engine for one named connection.
//!
//! An engine owns a `PgPool` built from a [`ConnectionConfig`]. The pool is
//! created with `connect_lazy_with`, so building an engine never touches the
//! network; physical connections are opened on first acquire.

use crate::db::session::ScopedSession;
use crate::error::DbResult;
use crate::models::ConnectionConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Instant;
use tracing::{debug, info};

/// Pooled engine bound to one connection configuration.
pub struct Engine {
    config: ConnectionConfig,
    pool: PgPool,
    echo: bool,
    created_at: Instant,
}

impl Engine {
    /// Build the engine and its (not yet connected) pool.
    ///
    /// Pool mapping: `max_connections = pool_size + max_overflow`,
    /// `acquire_timeout = pool_timeout`, `max_lifetime = pool_recycle`
    /// (0 disables recycling), connections are tested before being handed out.
    pub(crate) fn build(config: &ConnectionConfig, echo: bool) -> Self {
        let max_lifetime = (config.pool_recycle_secs > 0).then(|| config.pool_recycle());

        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(config.max_connections())
            .acquire_timeout(config.pool_timeout())
            .max_lifetime(max_lifetime)
            .test_before_acquire(true)
            .connect_lazy_with(config.connect_options(echo));

        info!(
            connection = %config.name,
            url = %config.masked_url(),
            max_connections = config.max_connections(),
            echo = echo,
            "Created engine"
        );

        Self {
            config: config.clone(),
            pool,
            echo,
            created_at: Instant::now(),
        }
    }

    /// Connection name this engine serves.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The underlying pool, for queries that do not need a unit of work.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether statements on this engine are logged.
    pub fn echo(&self) -> bool {
        self.echo
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Begin a new unit of work on this engine.
    pub async fn begin(&self) -> DbResult<ScopedSession> {
        let tx = self.pool.begin().await?;
        debug!(connection = %self.config.name, "Session started");
        Ok(ScopedSession::new(self.config.name.clone(), tx))
    }

    /// Run a trivial query through the pool.
    pub async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub(crate) async fn close(&self) {
        info!(connection = %self.config.name, "Closing engine");
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.config.name)
            .field("url", &self.config.masked_url())
            .field("echo", &self.echo)
            .field("pool_size", &self.pool.size())
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("default", "localhost", "app", "secret", "app_db").with_pool(2, 3)
    }

    #[tokio::test]
    async fn test_build_is_lazy() {
        let engine = Engine::build(&config(), false);
        assert_eq!(engine.name(), "default");
        assert!(engine.created_at() <= Instant::now());
        // No physical connection is opened until first use
        assert_eq!(engine.pool().size(), 0);
        assert!(!engine.is_closed());
        assert_eq!(engine.pool().options().get_max_connections(), 5);
    }

    #[tokio::test]
    async fn test_pool_options_follow_config() {
        let engine = Engine::build(&config(), true);
        let options = engine.pool().options();
        assert_eq!(options.get_acquire_timeout(), config().pool_timeout());
        assert_eq!(options.get_max_lifetime(), Some(config().pool_recycle()));
        assert_eq!(options.get_min_connections(), 0);
        assert!(engine.echo());
    }

    #[tokio::test]
    async fn test_zero_recycle_disables_max_lifetime() {
        let config = ConnectionConfig {
            pool_recycle_secs: 0,
            ..config()
        };
        let engine = Engine::build(&config, false);
        assert_eq!(engine.pool().options().get_max_lifetime(), None);
    }

    #[tokio::test]
    async fn test_close() {
        let engine = Engine::build(&config(), false);
        engine.close().await;
        assert!(engine.is_closed());
    }

    #[tokio::test]
    async fn test_debug_hides_password() {
        let engine = Engine::build(&config(), false);
        let debug = format!("{:?}", engine);
        assert!(!debug.contains("secret"));
    }
}
