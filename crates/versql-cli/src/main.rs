use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use versql_common::{Statement, Value};
use versql_config::{AppConfig, ConfigLoader};
use versql_db::{DatabaseTarget, LogSink, MigrationCatalog, Session};

#[derive(Parser)]
#[command(
    name = "versql",
    version,
    about = "versql - versioned schema migrations for SQLite"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); defaults to the config's `log_level`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory holding config.yml / config.toml
    #[arg(long, global = true, env = "VERSQL_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Print the transaction log to stderr
    #[arg(long, global = true)]
    show_log: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the database schema up to the configured version
    Upgrade {
        /// Drop every table and rebuild from version 0
        #[arg(long)]
        reset: bool,
    },

    /// Show stored and target schema versions
    Status,

    /// Run a statement that returns no rows
    Exec {
        sql: String,
        params: Vec<String>,
    },

    /// Run an insert and print the new row id
    Insert {
        sql: String,
        params: Vec<String>,
    },

    /// Run a query and print the rows as JSON
    Query {
        sql: String,
        params: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new()?,
    };
    let config = loader.load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level(&cli, &config))),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("using config directory {}", loader.config_dir().display());
    loader.ensure_dirs(&config)?;

    let target = database_target(&loader, &config);
    let catalog = MigrationCatalog::new(config.migrations.clone());

    match cli.command {
        Commands::Upgrade { reset } => {
            let session = with_log(
                Session::new(target, catalog, config.database.version)?,
                cli.show_log,
            );
            let report = session.open(reset).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let target_version = match config.database.version {
                Some(version) => Some(version),
                None if catalog.is_empty() => None,
                None => Some(catalog.highest_version()?),
            };
            let session = with_log(Session::unmanaged(target), cli.show_log);
            session.open(false).await?;

            let current = session.current_version();
            let pending: Vec<u32> = target_version
                .map(|to| {
                    catalog
                        .applicable(current, to)
                        .iter()
                        .map(|m| m.version)
                        .collect()
                })
                .unwrap_or_default();
            let status = serde_json::json!({
                "database": session.database_name(),
                "location": session.target().to_string(),
                "current_version": current,
                "target_version": target_version,
                "pending": pending,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Exec { sql, params } => {
            let session = open_session(target, catalog, &config, cli.show_log).await?;
            session.run_update(statement(sql, &params)).await?;
            println!("ok");
        }
        Commands::Insert { sql, params } => {
            let session = open_session(target, catalog, &config, cli.show_log).await?;
            let ids = session.run_insert(statement(sql, &params)).await?;
            println!("{}", serde_json::to_string_pretty(&ids)?);
        }
        Commands::Query { sql, params } => {
            let session = open_session(target, catalog, &config, cli.show_log).await?;
            let rows = session.run_query(statement(sql, &params)).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

fn log_level<'a>(cli: &'a Cli, config: &'a AppConfig) -> &'a str {
    cli.log_level
        .as_deref()
        .or(config.log_level.as_deref())
        .unwrap_or("info")
}

fn database_target(loader: &ConfigLoader, config: &AppConfig) -> DatabaseTarget {
    if config.database.in_memory {
        DatabaseTarget::Memory
    } else {
        DatabaseTarget::in_dir(&loader.data_dir(config), &config.database.name)
    }
}

async fn open_session(
    target: DatabaseTarget,
    catalog: MigrationCatalog,
    config: &AppConfig,
    show_log: bool,
) -> Result<Session> {
    let session = if catalog.is_empty() && config.database.version.is_none() {
        Session::unmanaged(target)
    } else {
        Session::new(target, catalog, config.database.version)?
    };
    let session = with_log(session, show_log);
    session
        .open(false)
        .await
        .with_context(|| format!("failed to open database {}", session.database_name()))?;
    Ok(session)
}

fn with_log(session: Session, show_log: bool) -> Session {
    if !show_log {
        return session;
    }
    let sink: LogSink = Arc::new(|line: &str| eprintln!("{line}"));
    session.with_log_sink(sink)
}

fn statement(sql: String, params: &[String]) -> Statement {
    Statement::with_params(sql, params.iter().map(|raw| parse_param(raw)))
}

/// Integer, then real, then `null`; anything else binds as text.
fn parse_param(raw: &str) -> Value {
    if let Ok(v) = raw.parse::<i64>() {
        Value::Integer(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        Value::Real(v)
    } else if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else {
        Value::Text(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, database_target, log_level, parse_param, statement};
    use clap::{CommandFactory, Parser};
    use std::path::PathBuf;
    use versql_common::Value;
    use versql_config::{AppConfig, ConfigLoader};
    use versql_db::DatabaseTarget;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn log_level_falls_back_to_config() {
        let mut config = AppConfig::default();
        config.log_level = Some("warn".to_string());

        let cli = Cli::parse_from(["versql", "status"]);
        assert_eq!(log_level(&cli, &config), "warn");

        let cli = Cli::parse_from(["versql", "--log-level", "debug", "status"]);
        assert_eq!(log_level(&cli, &config), "debug");

        config.log_level = None;
        let cli = Cli::parse_from(["versql", "status"]);
        assert_eq!(log_level(&cli, &config), "info");
    }

    #[test]
    fn params_parse_by_shape() {
        assert_eq!(parse_param("42"), Value::Integer(42));
        assert_eq!(parse_param("-1.5"), Value::Real(-1.5));
        assert_eq!(parse_param("NULL"), Value::Null);
        assert_eq!(parse_param("hello"), Value::Text("hello".into()));
    }

    #[test]
    fn statement_binds_params_in_order() {
        let stmt = statement(
            "INSERT INTO t VALUES (?, ?)".to_string(),
            &["1".to_string(), "x".to_string()],
        );
        assert_eq!(stmt.params, vec![Value::Integer(1), Value::Text("x".into())]);
    }

    #[test]
    fn target_follows_config() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let loader = ConfigLoader::with_dir(dir.path());

        let mut config = AppConfig::default();
        config.database.name = "notes".to_string();
        assert_eq!(
            database_target(&loader, &config),
            DatabaseTarget::File(dir.path().join("data").join("notes.db"))
        );

        config.data_dir = Some(PathBuf::from("/srv/versql"));
        assert_eq!(
            database_target(&loader, &config),
            DatabaseTarget::File(PathBuf::from("/srv/versql/notes.db"))
        );

        config.database.in_memory = true;
        assert_eq!(database_target(&loader, &config), DatabaseTarget::Memory);
    }
}
