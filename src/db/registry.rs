//! Connection registry: named configurations with lazily built engines.
//!
//! # Design Decisions
//!
//! - **Explicit instance**: the registry is constructed from
//!   [`DatabaseSettings`] and shared as `Arc<ConnectionRegistry>`; there is no
//!   process-wide global.
//! - **`OnceCell` per connection name**: single-flight engine creation.
//!   Concurrent first requests for the same name wait for one build and share
//!   its `Arc<Engine>`.
//! - **Double-checked cell lookup**: the map `RwLock` is held only to find or
//!   insert a cell, never while an engine is built, so different names do not
//!   serialize against each other.
//!
//! # Known limitation
//!
//! [`ConnectionRegistry::shutdown`] does not drain in-flight callers. A caller
//! that looked up a cell just before shutdown removed it may still build an
//! engine on that orphaned cell; that engine is dropped with the caller's
//! last `Arc` instead of being closed by the registry. Callers must not issue
//! new session requests concurrently with shutdown.

use crate::db::admin;
use crate::db::engine::Engine;
use crate::db::session::ScopedSession;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, ConnectionSummary};
use crate::settings::DatabaseSettings;
use futures_util::future::BoxFuture;
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

type EngineCell = Arc<OnceCell<Arc<Engine>>>;

pub struct ConnectionRegistry {
    /// Configurations in insertion order.
    configs: Vec<ConnectionConfig>,
    /// Connection name -> position in `configs`.
    index: HashMap<String, usize>,
    default_connection: String,
    echo: bool,
    /// Per-name lazy engines. OnceCell ensures single-flight creation.
    engines: RwLock<HashMap<String, EngineCell>>,
    /// Engine builds so far.
    #[cfg(test)]
    builds: std::sync::atomic::AtomicUsize,
}

/// Build a registry from settings, loading them from the environment when `None`.
pub fn startup(settings: Option<DatabaseSettings>) -> DbResult<Arc<ConnectionRegistry>> {
    let settings = match settings {
        Some(settings) => settings,
        None => DatabaseSettings::from_env()?,
    };
    let registry = Arc::new(ConnectionRegistry::new(settings)?);
    info!(
        connections = registry.configs.len(),
        default_connection = %registry.default_connection,
        "Connection registry started"
    );
    Ok(registry)
}

impl ConnectionRegistry {
    /// Create a registry. No engine is built until first use.
    pub fn new(settings: DatabaseSettings) -> DbResult<Self> {
        let DatabaseSettings {
            connections,
            default_connection,
            echo,
        } = settings;

        if connections.is_empty() {
            return Err(DbError::config(
                "At least one database connection must be configured",
            ));
        }

        let mut index = HashMap::with_capacity(connections.len());
        for (position, config) in connections.iter().enumerate() {
            config
                .validate()
                .map_err(|e| DbError::config(format!("Connection '{}': {}", config.name, e)))?;
            if index.insert(config.name.clone(), position).is_some() {
                return Err(DbError::config(format!(
                    "Duplicate connection name '{}'",
                    config.name
                )));
            }
        }

        if !index.contains_key(&default_connection) {
            return Err(DbError::config(format!(
                "Default connection '{}' is not configured",
                default_connection
            )));
        }

        Ok(Self {
            configs: connections,
            index,
            default_connection,
            echo,
            engines: RwLock::new(HashMap::new()),
            #[cfg(test)]
            builds: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Name used when callers do not specify a connection.
    pub fn default_connection(&self) -> &str {
        &self.default_connection
    }

    /// Global echo flag.
    pub fn echo(&self) -> bool {
        self.echo
    }

    /// All configured connection names, in configuration order.
    pub fn list_connections(&self) -> Vec<String> {
        self.configs.iter().map(|c| c.name.clone()).collect()
    }

    /// Resolve a connection name (or the default) to its configuration.
    pub fn connection_config(&self, name: Option<&str>) -> DbResult<&ConnectionConfig> {
        let name = name.unwrap_or(&self.default_connection);
        self.index
            .get(name)
            .map(|&position| &self.configs[position])
            .ok_or_else(|| {
                DbError::connection_not_found(name, self.configs.iter().map(|c| c.name.as_str()))
            })
    }

    /// Check if a connection has superuser privileges.
    pub fn is_superuser_connection(&self, name: Option<&str>) -> DbResult<bool> {
        Ok(self.connection_config(name)?.is_superuser)
    }

    /// Name of the first superuser-flagged connection, in configuration order.
    pub fn superuser_connection_name(&self) -> Option<&str> {
        self.configs
            .iter()
            .find(|c| c.is_superuser)
            .map(|c| c.name.as_str())
    }

    /// Get or create the engine for a connection.
    ///
    /// Uses a OnceCell per connection name for single-flight creation -
    /// concurrent requests for the same name wait for the first to complete.
    pub async fn get_engine(&self, name: Option<&str>) -> DbResult<Arc<Engine>> {
        let config = self.connection_config(name)?;

        // Get or create the OnceCell for this connection
        let cell = {
            let engines = self.engines.read().await;
            if let Some(cell) = engines.get(&config.name) {
                Arc::clone(cell)
            } else {
                drop(engines);
                let mut engines = self.engines.write().await;
                // Double-check after acquiring write lock
                if let Some(cell) = engines.get(&config.name) {
                    Arc::clone(cell)
                } else {
                    let cell: EngineCell = Arc::new(OnceCell::new());
                    engines.insert(config.name.clone(), Arc::clone(&cell));
                    cell
                }
            }
        };

        let echo = self.echo || config.echo;
        let engine = cell
            .get_or_init(|| async {
                #[cfg(test)]
                {
                    self.builds
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    // Let contending callers run while the build is in flight
                    tokio::task::yield_now().await;
                }
                Arc::new(Engine::build(config, echo))
            })
            .await;

        debug!(connection = %config.name, "Returning engine");
        Ok(Arc::clone(engine))
    }

    /// Open a scoped session on a connection's engine.
    pub async fn acquire_session(&self, name: Option<&str>) -> DbResult<ScopedSession> {
        let engine = self.get_engine(name).await?;
        engine.begin().await
    }

    /// Run `f` inside a scoped session.
    ///
    /// Commits when `f` returns `Ok`; rolls back and returns the error when it
    /// returns `Err`. If the returned future is dropped before completion the
    /// session is rolled back.
    ///
    /// ```ignore
    /// registry
    ///     .run_in_session(Some("business"), |conn| {
    ///         Box::pin(async move {
    ///             sqlx::query("INSERT INTO items (name) VALUES ('a')")
    ///                 .execute(&mut *conn)
    ///                 .await?;
    ///             Ok::<_, DbError>(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_in_session<F, T, E>(&self, name: Option<&str>, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        let mut session = self.acquire_session(name).await?;
        let result = f(&mut *session).await;
        session.finish(result).await
    }

    /// Run `SELECT 1` through a connection's engine.
    ///
    /// Returns `Ok(false)` when the query fails; unknown names are errors.
    pub async fn health_check(&self, name: Option<&str>) -> DbResult<bool> {
        let engine = self.get_engine(name).await?;
        match engine.ping().await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(connection = %engine.name(), error = %e, "Health check failed");
                Ok(false)
            }
        }
    }

    /// Whether an engine has been built for a connection.
    pub async fn is_materialized(&self, name: &str) -> bool {
        let engines = self.engines.read().await;
        engines
            .get(name)
            .is_some_and(|cell| cell.get().is_some())
    }

    /// Number of built engines.
    pub async fn engine_count(&self) -> usize {
        let engines = self.engines.read().await;
        engines.values().filter(|cell| cell.get().is_some()).count()
    }

    /// Secret-free summary of every configured connection.
    pub async fn connection_summaries(&self) -> Vec<ConnectionSummary> {
        let engines = self.engines.read().await;
        self.configs
            .iter()
            .map(|config| {
                let materialized = engines
                    .get(&config.name)
                    .is_some_and(|cell| cell.get().is_some());
                ConnectionSummary::new(config, materialized)
            })
            .collect()
    }

    /// Close every built engine and clear the engine map.
    ///
    /// Idempotent. Engines are rebuilt on the next `get_engine`.
    pub async fn shutdown(&self) {
        // Drain under lock, close outside lock
        let mut drained: Vec<(String, EngineCell)> = {
            let mut engines = self.engines.write().await;
            engines.drain().collect()
        };
        drained.sort_by_key(|(name, _)| self.index.get(name).copied());

        let mut closed = 0usize;
        for (_, cell) in drained {
            if let Some(engine) = cell.get() {
                engine.close().await;
                closed += 1;
            }
        }
        info!(engines = closed, "Connection registry shut down");
    }

    /// Resolve the connection used for administrative operations.
    ///
    /// A named connection must be superuser-flagged; without a name the first
    /// superuser-flagged connection in configuration order is used.
    pub fn admin_config(&self, name: Option<&str>) -> DbResult<&ConnectionConfig> {
        match name {
            Some(name) => {
                let config = self.connection_config(Some(name))?;
                if !config.is_superuser {
                    return Err(DbError::not_superuser(name));
                }
                Ok(config)
            }
            None => self
                .configs
                .iter()
                .find(|c| c.is_superuser)
                .ok_or(DbError::NoSuperuserConnection),
        }
    }

    /// Check whether a database exists.
    pub async fn database_exists(&self, database: &str, connection: Option<&str>) -> DbResult<bool> {
        let config = self.admin_config(connection)?;
        admin::database_exists(config, self.echo || config.echo, database).await
    }

    /// Create a database. Returns `false` when it already exists.
    pub async fn create_database(
        &self,
        database: &str,
        owner: Option<&str>,
        connection: Option<&str>,
    ) -> DbResult<bool> {
        let config = self.admin_config(connection)?;
        admin::create_database(config, self.echo || config.echo, database, owner).await
    }

    /// Drop a database. Returns `false` when it does not exist.
    ///
    /// With `force`, other sessions connected to the database are terminated first.
    pub async fn drop_database(
        &self,
        database: &str,
        force: bool,
        connection: Option<&str>,
    ) -> DbResult<bool> {
        let config = self.admin_config(connection)?;
        admin::drop_database(config, self.echo || config.echo, database, force).await
    }

    /// List non-template databases, in catalog order.
    pub async fn list_databases(&self, connection: Option<&str>) -> DbResult<Vec<String>> {
        let config = self.admin_config(connection)?;
        admin::list_databases(config, self.echo || config.echo).await
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.configs)
            .field("default_connection", &self.default_connection)
            .field("echo", &self.echo)
            .finish_non_exhaustive()
    }
}
