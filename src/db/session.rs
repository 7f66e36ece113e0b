//! Scoped sessions: one unit of work bound to an engine.
//!
//! A [`ScopedSession`] wraps a `sqlx` transaction. It is finished exactly once:
//! by [`ScopedSession::commit`], [`ScopedSession::rollback`] or
//! [`ScopedSession::finish`], or by being dropped. Dropping an unfinished
//! session (early return, panic, cancelled future) rolls the transaction back
//! and returns the connection to the pool.

use crate::error::{DbError, DbResult};
use sqlx::{PgConnection, Postgres, Transaction};
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

/// Caller-owned unit of work with commit/rollback-on-exit semantics.
///
/// Derefs to [`PgConnection`], so queries run with `.execute(&mut *session)`.
pub struct ScopedSession {
    tx: Transaction<'static, Postgres>,
    guard: DropGuard,
}

impl ScopedSession {
    pub(crate) fn new(connection_name: String, tx: Transaction<'static, Postgres>) -> Self {
        Self {
            tx,
            guard: DropGuard {
                connection_name,
                armed: true,
            },
        }
    }

    /// Name of the connection this session was opened on.
    pub fn connection_name(&self) -> &str {
        &self.guard.connection_name
    }

    /// The underlying transaction, e.g. to open savepoints.
    pub fn transaction(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.tx
    }

    /// Commit the unit of work.
    pub async fn commit(self) -> DbResult<()> {
        let Self { tx, mut guard } = self;
        guard.armed = false;
        tx.commit().await.map_err(DbError::from)?;
        debug!(connection = %guard.connection_name, "Session committed");
        Ok(())
    }

    /// Roll the unit of work back.
    pub async fn rollback(self) -> DbResult<()> {
        let Self { tx, mut guard } = self;
        guard.armed = false;
        tx.rollback().await.map_err(DbError::from)?;
        debug!(connection = %guard.connection_name, "Session rolled back");
        Ok(())
    }

    /// Commit when `result` is `Ok`, roll back when it is `Err`.
    ///
    /// On `Err` the original error is returned after the rollback; a failing
    /// rollback is logged and does not replace it. On `Ok` a failing commit is
    /// returned as the error.
    pub async fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<DbError>,
    {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let connection_name = self.connection_name().to_string();
                if let Err(rollback_err) = self.rollback().await {
                    warn!(
                        connection = %connection_name,
                        error = %rollback_err,
                        "Rollback after failed unit of work also failed"
                    );
                }
                Err(err)
            }
        }
    }
}

impl Deref for ScopedSession {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.tx
    }
}

impl DerefMut for ScopedSession {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

impl std::fmt::Debug for ScopedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedSession")
            .field("connection", &self.guard.connection_name)
            .finish_non_exhaustive()
    }
}

/// Reports sessions that were dropped without being finished. The transaction
/// itself queues the rollback when it is dropped.
struct DropGuard {
    connection_name: String,
    armed: bool,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                connection = %self.connection_name,
                "Session dropped without commit, rolling back"
            );
        }
    }
}
