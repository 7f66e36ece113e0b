//! Database settings loaded from `DB_*` environment variables.
//!
//! Variables use the `DB_` prefix (case insensitive) and `__` as the nesting
//! delimiter:
//!
//! ```text
//! DB_DEFAULT_CONNECTION=default
//! DB_ECHO=false
//! DB_CONNECTIONS__DEFAULT__HOST=localhost
//! DB_CONNECTIONS__DEFAULT__USERNAME=app
//! DB_CONNECTIONS__DEFAULT__PASSWORD=secret
//! DB_CONNECTIONS__DEFAULT__DATABASE=app_db
//! DB_CONNECTIONS__ADMIN__IS_SUPERUSER=true
//! ```
//!
//! `DB_CONNECTIONS` may also hold a JSON object keyed by connection name.
//! Nested variables override fields given in the JSON object. A `.env` file is
//! read first and the process environment overrides it.

use crate::config::{DEFAULT_CONNECTION_NAME, DEFAULT_ENV_FILE};
use crate::error::{DbError, DbResult};
use crate::models::ConnectionConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

const PREFIX: &str = "DB_";
const CONNECTIONS_KEY: &str = "DB_CONNECTIONS";
const CONNECTIONS_PREFIX: &str = "DB_CONNECTIONS__";
const DEFAULT_CONNECTION_KEY: &str = "DB_DEFAULT_CONNECTION";
const ECHO_KEY: &str = "DB_ECHO";

/// Input of a [`crate::ConnectionRegistry`]: ordered connections plus globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    /// Connections in configuration order.
    pub connections: Vec<ConnectionConfig>,
    /// Connection used when callers do not name one.
    pub default_connection: String,
    /// Global statement logging, OR-ed with each connection's `echo`.
    pub echo: bool,
}

impl DatabaseSettings {
    pub fn new(connections: Vec<ConnectionConfig>) -> Self {
        Self {
            connections,
            default_connection: DEFAULT_CONNECTION_NAME.to_string(),
            echo: false,
        }
    }

    pub fn with_default_connection(mut self, name: impl Into<String>) -> Self {
        self.default_connection = name.into();
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Replace the connection with the same name, or append it.
    pub fn with_connection(mut self, config: ConnectionConfig) -> Self {
        match self.connections.iter_mut().find(|c| c.name == config.name) {
            Some(existing) => *existing = config,
            None => self.connections.push(config),
        }
        self
    }

    /// Load settings from `./.env` (when present) and the process environment.
    pub fn from_env() -> DbResult<Self> {
        let path = Path::new(DEFAULT_ENV_FILE);
        Self::from_env_file(path.is_file().then_some(path))
    }

    /// Load settings from an optional dotenv file and the process environment.
    pub fn from_env_file(path: Option<&Path>) -> DbResult<Self> {
        let mut vars = Vec::new();

        if let Some(path) = path {
            let iter = dotenvy::from_path_iter(path).map_err(|e| {
                DbError::config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            for item in iter {
                let (key, value) = item.map_err(|e| {
                    DbError::config(format!("Failed to parse {}: {}", path.display(), e))
                })?;
                vars.push((key, value));
            }
            debug!(path = %path.display(), count = vars.len(), "Read dotenv file");
        }

        // Non UTF-8 variables cannot belong to us
        vars.extend(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        );

        let settings = Self::from_vars(vars)?;
        if settings.connections.is_empty() {
            warn!(
                "No database connections configured. Example: DB_CONNECTIONS__DEFAULT__HOST=localhost"
            );
        }
        Ok(settings)
    }

    /// Build settings from key/value pairs. Later pairs override earlier ones.
    pub fn from_vars<I, K, V>(vars: I) -> DbResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut json_connections: Option<String> = None;
        let mut nested: Vec<(String, String, String, String)> = Vec::new();
        let mut default_connection: Option<String> = None;
        let mut echo = false;

        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref();
            let upper = key.to_ascii_uppercase();
            if !upper.starts_with(PREFIX) {
                continue;
            }

            if upper == CONNECTIONS_KEY {
                json_connections = Some(value.to_string());
            } else if upper == DEFAULT_CONNECTION_KEY {
                default_connection = Some(value.trim().to_string()).filter(|v| !v.is_empty());
            } else if upper == ECHO_KEY {
                echo = parse_bool(value).ok_or_else(|| invalid_var(key, value, "a boolean"))?;
            } else if let Some(rest) = upper.strip_prefix(CONNECTIONS_PREFIX) {
                let mut parts = rest.split("__");
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(name), Some(field), None) if !name.is_empty() && !field.is_empty() => {
                        nested.push((
                            name.to_ascii_lowercase(),
                            field.to_ascii_lowercase(),
                            key.to_string(),
                            value.to_string(),
                        ));
                    }
                    _ => debug!(key = %key, "Ignoring malformed connection variable"),
                }
            }
        }

        let mut order: Vec<String> = Vec::new();
        let mut partials: HashMap<String, PartialConnection> = HashMap::new();

        if let Some(raw) = json_connections {
            let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
                .map_err(|e| {
                    DbError::config(format!("{} must be a JSON object: {}", CONNECTIONS_KEY, e))
                })?;
            for (name, value) in map {
                let partial: PartialConnection = serde_json::from_value(value).map_err(|e| {
                    DbError::config(format!(
                        "Invalid connection '{}' in {}: {}",
                        name, CONNECTIONS_KEY, e
                    ))
                })?;
                if !partials.contains_key(&name) {
                    order.push(name.clone());
                }
                partials.insert(name, partial);
            }
        }

        for (name, field, key, value) in nested {
            // Nested names are lowercased, JSON keys keep their spelling
            let name = order
                .iter()
                .find(|known| known.eq_ignore_ascii_case(&name))
                .cloned()
                .unwrap_or(name);
            if !partials.contains_key(&name) {
                order.push(name.clone());
            }
            partials
                .entry(name)
                .or_default()
                .apply(&field, &key, &value)?;
        }

        let mut connections = Vec::with_capacity(order.len());
        for name in order {
            if let Some(partial) = partials.remove(&name) {
                connections.push(partial.into_config(name)?);
            }
        }

        Ok(Self {
            connections,
            default_connection: default_connection
                .unwrap_or_else(|| DEFAULT_CONNECTION_NAME.to_string()),
            echo,
        })
    }

    /// Get a connection by name, or the default connection when `None`.
    pub fn get_connection(&self, name: Option<&str>) -> DbResult<&ConnectionConfig> {
        let name = name.unwrap_or(&self.default_connection);
        self.connections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                DbError::connection_not_found(name, self.connections.iter().map(|c| c.name.as_str()))
            })
    }

    pub fn has_connection(&self, name: &str) -> bool {
        self.connections.iter().any(|c| c.name == name)
    }

    /// Name of the first superuser-flagged connection, in configuration order.
    pub fn superuser_connection_name(&self) -> Option<&str> {
        self.connections
            .iter()
            .find(|c| c.is_superuser)
            .map(|c| c.name.as_str())
    }
}

/// One connection as read from the environment, before required fields are checked.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialConnection {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    database: Option<String>,
    is_superuser: Option<bool>,
    pool_size: Option<u32>,
    max_overflow: Option<u32>,
    #[serde(alias = "pool_timeout_secs")]
    pool_timeout: Option<u64>,
    #[serde(alias = "pool_recycle_secs")]
    pool_recycle: Option<u64>,
    echo: Option<bool>,
}

impl PartialConnection {
    /// Apply one `DB_CONNECTIONS__<NAME>__<FIELD>` variable. Unknown fields are ignored.
    fn apply(&mut self, field: &str, key: &str, value: &str) -> DbResult<()> {
        match field {
            "host" => self.host = Some(value.to_string()),
            "port" => self.port = Some(parse_number(key, value)?),
            "username" => self.username = Some(value.to_string()),
            "password" => self.password = Some(value.to_string()),
            "database" => self.database = Some(value.to_string()),
            "is_superuser" => {
                self.is_superuser =
                    Some(parse_bool(value).ok_or_else(|| invalid_var(key, value, "a boolean"))?)
            }
            "pool_size" => self.pool_size = Some(parse_number(key, value)?),
            "max_overflow" => self.max_overflow = Some(parse_number(key, value)?),
            "pool_timeout" => self.pool_timeout = Some(parse_number(key, value)?),
            "pool_recycle" => self.pool_recycle = Some(parse_number(key, value)?),
            "echo" => {
                self.echo =
                    Some(parse_bool(value).ok_or_else(|| invalid_var(key, value, "a boolean"))?)
            }
            _ => debug!(key = %key, "Ignoring unknown connection field"),
        }
        Ok(())
    }

    fn into_config(self, name: String) -> DbResult<ConnectionConfig> {
        let required = |field: Option<String>, what: &str| {
            field.ok_or_else(|| {
                DbError::config(format!(
                    "Connection '{}' is missing '{}' ({}{}__{})",
                    name,
                    what,
                    CONNECTIONS_PREFIX,
                    name.to_ascii_uppercase(),
                    what.to_ascii_uppercase()
                ))
            })
        };

        let mut config = ConnectionConfig::new(
            name.clone(),
            required(self.host, "host")?,
            required(self.username, "username")?,
            required(self.password, "password")?,
            required(self.database, "database")?,
        );
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(is_superuser) = self.is_superuser {
            config.is_superuser = is_superuser;
        }
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(max_overflow) = self.max_overflow {
            config.max_overflow = max_overflow;
        }
        if let Some(pool_timeout) = self.pool_timeout {
            config.pool_timeout_secs = pool_timeout;
        }
        if let Some(pool_recycle) = self.pool_recycle {
            config.pool_recycle_secs = pool_recycle;
        }
        if let Some(echo) = self.echo {
            config.echo = echo;
        }

        config
            .validate()
            .map_err(|e| DbError::config(format!("Connection '{}': {}", name, e)))?;
        Ok(config)
    }
}

/// Parse a boolean the way settings loaders commonly do.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "y" | "t" => Some(true),
        "false" | "0" | "no" | "off" | "n" | "f" => Some(false),
        _ => None,
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> DbResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid_var(key, value, "a non-negative integer in range"))
}

fn invalid_var(key: &str, value: &str, expected: &str) -> DbError {
    DbError::config(format!("{}='{}' is not {}", key, value, expected))
}
