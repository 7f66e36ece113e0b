//! pg-multi - command line entry point.
//!
//! Builds a connection registry from `DB_*` variables (and an optional .env
//! file), runs one inspection or administration command, and shuts the
//! registry down before exiting.

use clap::Parser;
use pg_multi::config::{Command, Config};
use pg_multi::{ConnectionConfig, ConnectionRegistry, DatabaseSettings, DbError, DbResult};
use serde_json::json;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging. Logs go to stderr so that
/// command output on stdout stays parseable.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn emit(config: &Config, value: serde_json::Value, text: impl std::fmt::Display) {
    if config.json {
        println!("{}", value);
    } else {
        println!("{}", text);
    }
}

async fn run(config: &Config, registry: &ConnectionRegistry) -> DbResult<ExitCode> {
    let connection = config.connection.as_deref();

    match &config.command {
        Command::Connections => {
            let summaries = registry.connection_summaries().await;
            if config.json {
                println!("{}", json!(summaries));
            } else {
                for s in summaries {
                    let flag = if s.is_superuser { " (superuser)" } else { "" };
                    let default = if s.name == registry.default_connection() {
                        " [default]"
                    } else {
                        ""
                    };
                    println!(
                        "{}{}\t{}@{}:{}/{}{}",
                        s.name, default, s.username, s.host, s.port, s.database, flag
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Health { all } => {
            let names = if *all {
                registry.list_connections()
            } else {
                vec![registry.connection_config(connection)?.name.clone()]
            };

            let mut healthy = true;
            for name in names {
                let ok = registry.health_check(Some(&name)).await?;
                healthy &= ok;
                emit(
                    config,
                    json!({ "connection": name, "healthy": ok }),
                    format!("{}: {}", name, if ok { "ok" } else { "unreachable" }),
                );
            }
            Ok(if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Databases => {
            let databases = registry.list_databases(connection).await?;
            if config.json {
                println!("{}", json!(databases));
            } else {
                for name in databases {
                    println!("{}", name);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Exists { name } => {
            let exists = registry.database_exists(name, connection).await?;
            emit(
                config,
                json!({ "database": name, "exists": exists }),
                exists,
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Create { name, owner } => {
            let created = registry
                .create_database(name, owner.as_deref(), connection)
                .await?;
            emit(
                config,
                json!({ "database": name, "created": created }),
                if created {
                    format!("Database '{}' created", name)
                } else {
                    format!("Database '{}' already exists", name)
                },
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Drop { name, force } => {
            let dropped = registry.drop_database(name, *force, connection).await?;
            emit(
                config,
                json!({ "database": name, "dropped": dropped }),
                if dropped {
                    format!("Database '{}' dropped", name)
                } else {
                    format!("Database '{}' does not exist", name)
                },
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load settings from the environment and apply the `--url` override.
fn load_settings(config: &Config) -> DbResult<DatabaseSettings> {
    let settings = DatabaseSettings::from_env_file(config.env_file_path())?;
    let Some(url) = config.url.as_deref() else {
        return Ok(settings);
    };

    let name = config
        .connection
        .clone()
        .unwrap_or_else(|| settings.default_connection.clone());
    let connection = ConnectionConfig::from_url(name, url)
        .map_err(|e| DbError::config(format!("Invalid --url: {}", e)))?;
    info!(
        connection = %connection.name,
        url = %connection.masked_url(),
        "Using connection URL override"
    );
    Ok(settings.with_connection(connection))
}

fn report(err: &DbError) {
    error!(error = %err, "Command failed");
    eprintln!("Error: {}", err);
    if let Some(suggestion) = err.suggestion() {
        eprintln!("Hint: {}", suggestion);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!("Starting pg-multi v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings(&config);
    let registry = match settings.and_then(|settings| pg_multi::startup(Some(settings))) {
        Ok(registry) => registry,
        Err(e) => {
            report(&e);
            eprintln!();
            eprintln!("Configure connections through DB_* variables, e.g.:");
            eprintln!("  DB_CONNECTIONS__DEFAULT__HOST=localhost");
            eprintln!("  DB_CONNECTIONS__DEFAULT__USERNAME=myuser");
            eprintln!("  DB_CONNECTIONS__DEFAULT__PASSWORD=mypassword");
            eprintln!("  DB_CONNECTIONS__DEFAULT__DATABASE=mydb");
            eprintln!("  DB_CONNECTIONS__ADMIN__IS_SUPERUSER=true");
            return ExitCode::FAILURE;
        }
    };

    let result = run(&config, &registry).await;
    registry.shutdown().await;

    match result {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
