//! Administrative database operations.
//!
//! Every operation opens a transient `PgConnection` to the maintenance
//! database of a superuser connection (its own `database`, typically
//! `postgres`), runs its statements outside any transaction and closes the
//! connection again. The pooled engines are never used here since `CREATE
//! DATABASE` and `DROP DATABASE` cannot run inside a transaction block.

use crate::config::PROTECTED_DATABASES;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionConfig;
use sqlx::{Connection, PgConnection};
use tracing::{debug, info};

/// Administrative operation kinds, carried by administrative errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOperation {
    Exists,
    Create,
    Drop,
    List,
}

impl std::fmt::Display for AdminOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exists => write!(f, "exists"),
            Self::Create => write!(f, "create"),
            Self::Drop => write!(f, "drop"),
            Self::List => write!(f, "list"),
        }
    }
}

mod queries {
    pub const DATABASE_EXISTS: &str = "SELECT 1 FROM pg_database WHERE datname = $1";

    /// Catalog order, no sorting applied.
    pub const LIST_DATABASES: &str =
        "SELECT datname::text FROM pg_database WHERE datistemplate = false";

    pub const TERMINATE_BACKENDS: &str = r#"
        SELECT pg_terminate_backend(pg_stat_activity.pid)
        FROM pg_stat_activity
        WHERE pg_stat_activity.datname = $1
          AND pid <> pg_backend_pid()
    "#;
}

/// Quote an identifier for interpolation into a utility statement.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn validate_identifier(kind: &str, name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::invalid_input(format!("{} name cannot be empty", kind)));
    }
    if name.contains('\0') {
        return Err(DbError::invalid_input(format!(
            "{} name cannot contain NUL characters",
            kind
        )));
    }
    Ok(())
}

/// Open the transient administrative connection.
async fn connect(
    config: &ConnectionConfig,
    echo: bool,
    operation: AdminOperation,
    database: &str,
) -> DbResult<PgConnection> {
    debug!(
        connection = %config.name,
        maintenance_db = %config.database,
        operation = %operation,
        "Opening administrative connection"
    );
    PgConnection::connect_with(&config.connect_options(echo))
        .await
        .map_err(|e| DbError::administrative(operation, database, e))
}

/// Close the transient connection. Failures are irrelevant to the operation outcome.
async fn close(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Administrative connection did not close cleanly");
    }
}

async fn exists_on(conn: &mut PgConnection, database: &str) -> Result<bool, sqlx::Error> {
    let row: Option<i32> = sqlx::query_scalar(queries::DATABASE_EXISTS)
        .bind(database)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

async fn create_on(
    conn: &mut PgConnection,
    database: &str,
    owner: Option<&str>,
) -> Result<bool, sqlx::Error> {
    if exists_on(conn, database).await? {
        return Ok(false);
    }

    let statement = match owner {
        Some(owner) => format!(
            "CREATE DATABASE {} OWNER {}",
            quote_ident(database),
            quote_ident(owner)
        ),
        None => format!("CREATE DATABASE {}", quote_ident(database)),
    };
    sqlx::raw_sql(&statement).execute(&mut *conn).await?;
    Ok(true)
}

async fn drop_on(conn: &mut PgConnection, database: &str, force: bool) -> Result<bool, sqlx::Error> {
    if !exists_on(conn, database).await? {
        return Ok(false);
    }

    if force {
        let terminated = sqlx::query(queries::TERMINATE_BACKENDS)
            .bind(database)
            .fetch_all(&mut *conn)
            .await?;
        debug!(database = %database, sessions = terminated.len(), "Terminated sessions");
    }

    let statement = format!("DROP DATABASE {}", quote_ident(database));
    sqlx::raw_sql(&statement).execute(&mut *conn).await?;
    Ok(true)
}

async fn list_on(conn: &mut PgConnection) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(queries::LIST_DATABASES)
        .fetch_all(&mut *conn)
        .await
}

/// Check whether `database` exists on the server of `config`.
pub(crate) async fn database_exists(
    config: &ConnectionConfig,
    echo: bool,
    database: &str,
) -> DbResult<bool> {
    validate_identifier("Database", database)?;
    let operation = AdminOperation::Exists;

    let mut conn = connect(config, echo, operation, database).await?;
    let result = exists_on(&mut conn, database).await;
    close(conn).await;

    result.map_err(|e| DbError::administrative(operation, database, e))
}

/// Create `database` unless it exists. Returns whether it was created.
pub(crate) async fn create_database(
    config: &ConnectionConfig,
    echo: bool,
    database: &str,
    owner: Option<&str>,
) -> DbResult<bool> {
    validate_identifier("Database", database)?;
    if let Some(owner) = owner {
        validate_identifier("Owner", owner)?;
    }
    let operation = AdminOperation::Create;

    let mut conn = connect(config, echo, operation, database).await?;
    let result = create_on(&mut conn, database, owner).await;
    close(conn).await;

    let created = result.map_err(|e| DbError::administrative(operation, database, e))?;
    if created {
        info!(connection = %config.name, database = %database, owner = ?owner, "Database created");
    } else {
        info!(connection = %config.name, database = %database, "Database already exists");
    }
    Ok(created)
}

/// Drop `database` if it exists. Returns whether it was dropped.
pub(crate) async fn drop_database(
    config: &ConnectionConfig,
    echo: bool,
    database: &str,
    force: bool,
) -> DbResult<bool> {
    validate_identifier("Database", database)?;
    if PROTECTED_DATABASES.contains(&database) {
        return Err(DbError::protected_database(database));
    }
    let operation = AdminOperation::Drop;

    let mut conn = connect(config, echo, operation, database).await?;
    let result = drop_on(&mut conn, database, force).await;
    close(conn).await;

    let dropped = result.map_err(|e| DbError::administrative(operation, database, e))?;
    if dropped {
        info!(connection = %config.name, database = %database, force = force, "Database dropped");
    } else {
        info!(connection = %config.name, database = %database, "Database does not exist");
    }
    Ok(dropped)
}

/// List non-template databases in catalog order.
pub(crate) async fn list_databases(config: &ConnectionConfig, echo: bool) -> DbResult<Vec<String>> {
    let operation = AdminOperation::List;
    let maintenance_db = config.database.as_str();

    let mut conn = connect(config, echo, operation, maintenance_db).await?;
    let result = list_on(&mut conn).await;
    close(conn).await;

    let databases = result.map_err(|e| DbError::administrative(operation, maintenance_db, e))?;
    debug!(count = databases.len(), "Listed PostgreSQL databases");
    Ok(databases)
}
