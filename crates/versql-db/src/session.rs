use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use versql_common::{Error, Result, SqlInput, Statement, check_version, normalize};

use crate::engine::{
    DatabaseTarget, Engine, EngineError, EngineTransaction, Row, StatementOutcome,
    TransactionMode,
};
use crate::migrations::MigrationCatalog;
use crate::sqlite::SqliteEngine;
use crate::transaction::{LogSink, SessionLog, TransactionFailure, TransactionLogger};

/// Decides which error a failed transaction resolves to.
pub type FailureHandler = Arc<dyn Fn(TransactionFailure) -> Error + Send + Sync>;

/// Joins every error recorded by the failed transaction into one `Fatal` error.
pub fn default_failure_handler(failure: TransactionFailure) -> Error {
    Error::Fatal(failure.to_string())
}

/// Resolves failures to `TransactionAborted`, keeping the sequence and name.
pub fn report_aborted(failure: TransactionFailure) -> Error {
    Error::TransactionAborted {
        sequence: failure.sequence,
        name: failure.name.clone(),
        errors: failure.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotReady,
    Upgrading,
    Ready,
    Failed,
}

/// What `open`, `upgrade`, or `drop_and_rebuild` did to the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeReport {
    pub from: u32,
    pub to: u32,
    /// Versions of the migrations that ran, in the order they ran.
    pub applied: Vec<u32>,
    /// Views and tables dropped by a reset, in drop order.
    pub dropped: Vec<String>,
}

impl UpgradeReport {
    fn unchanged(version: u32) -> Self {
        Self {
            from: version,
            to: version,
            applied: Vec::new(),
            dropped: Vec::new(),
        }
    }
}

/// Row ids from `run_insert`: one id for a single statement, one per
/// statement (in submission order) for a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InsertOutcome {
    Single(i64),
    Batch(Vec<i64>),
}

impl InsertOutcome {
    pub fn ids(&self) -> &[i64] {
        match self {
            Self::Single(id) => std::slice::from_ref(id),
            Self::Batch(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct VersionChange {
    from: u32,
    to: u32,
}

struct Inner<E> {
    engine: Option<E>,
    state: SessionState,
    current_version: u32,
}

/// One database connection with its schema version and transaction log.
///
/// ```no_run
/// # async fn demo() -> versql_common::Result<()> {
/// use versql_common::{Migration, Statement};
/// use versql_db::{DatabaseTarget, MigrationCatalog, Session};
///
/// let catalog = MigrationCatalog::new(vec![Migration::new(
///     1,
///     "CREATE TABLE notes (id INTEGER UNIQUE, body TEXT)",
/// )]);
/// let session = Session::new(DatabaseTarget::Memory, catalog, None)?;
/// session.open(false).await?;
/// session
///     .run_insert(Statement::new("INSERT INTO notes (id, body) VALUES (1, ?)").bind("hi"))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Session<E: Engine = SqliteEngine> {
    database_name: String,
    target: DatabaseTarget,
    catalog: Option<MigrationCatalog>,
    target_version: Option<u32>,
    log: SessionLog,
    on_failure: FailureHandler,
    inner: Mutex<Inner<E>>,
}

impl Session {
    /// Session over SQLite. The target version defaults to the catalog's
    /// highest version; an empty catalog then fails with `EmptyCatalog`.
    pub fn new(
        target: DatabaseTarget,
        catalog: MigrationCatalog,
        version: Option<u32>,
    ) -> Result<Self> {
        Self::for_engine(target, Some(catalog), version)
    }

    /// Session without migrations: `open` never changes the schema.
    pub fn unmanaged(target: DatabaseTarget) -> Self {
        Self::build(target, None, None)
    }
}

impl<E: Engine> Session<E> {
    pub fn for_engine(
        target: DatabaseTarget,
        catalog: Option<MigrationCatalog>,
        version: Option<u32>,
    ) -> Result<Self> {
        if let Some(catalog) = &catalog {
            catalog.validate()?;
        }
        let target_version = match (&catalog, version) {
            (_, Some(version)) => Some(check_version(version)?),
            (Some(catalog), None) => Some(catalog.highest_version()?),
            (None, None) => None,
        };
        Ok(Self::build(target, catalog, target_version))
    }

    fn build(
        target: DatabaseTarget,
        catalog: Option<MigrationCatalog>,
        target_version: Option<u32>,
    ) -> Self {
        let database_name = match &target {
            DatabaseTarget::File(path) => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            DatabaseTarget::Memory => ":memory:".to_string(),
        };

        Self {
            database_name,
            target,
            catalog,
            target_version,
            log: SessionLog::default(),
            on_failure: Arc::new(default_failure_handler),
            inner: Mutex::new(Inner {
                engine: None,
                state: SessionState::NotReady,
                current_version: 0,
            }),
        }
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log.set_sink(sink);
        self
    }

    pub fn with_failure_handler(
        mut self,
        handler: impl Fn(TransactionFailure) -> Error + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Arc::new(handler);
        self
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn target(&self) -> &DatabaseTarget {
        &self.target
    }

    pub fn target_version(&self) -> Option<u32> {
        self.target_version
    }

    pub fn current_version(&self) -> u32 {
        self.lock_state().current_version
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn transaction_count(&self) -> u64 {
        self.log.transaction_count()
    }

    /// Opens (or creates) the database and brings its schema to the target
    /// version. With `reset`, every user table and view is dropped first and all
    /// migrations run again from version 0. Resolves once the session is ready.
    pub async fn open(&self, reset: bool) -> Result<UpgradeReport> {
        self.open_sync(reset)
    }

    pub async fn upgrade(&self) -> Result<UpgradeReport> {
        self.upgrade_sync()
    }

    pub async fn drop_and_rebuild(&self) -> Result<UpgradeReport> {
        self.drop_and_rebuild_sync()
    }

    pub async fn run_update(&self, sql: impl Into<SqlInput> + Send) -> Result<()> {
        self.run_update_sync(sql.into())
    }

    pub async fn run_insert(&self, sql: impl Into<SqlInput> + Send) -> Result<InsertOutcome> {
        self.run_insert_sync(sql.into())
    }

    /// Rows of every statement, in submission order.
    pub async fn run_query(&self, sql: impl Into<SqlInput> + Send) -> Result<Vec<Row>> {
        self.run_query_sync(sql.into())
    }

    fn open_sync(&self, reset: bool) -> Result<UpgradeReport> {
        info!("opening database {} at {}", self.database_name, self.target);
        let engine = E::connect(&self.target).map_err(|e| {
            Error::ConnectionFailed(format!("failed to open {}: {e}", self.target))
        })?;
        let version = engine
            .version()
            .map_err(|e| Error::Database(format!("failed to read schema version: {e}")))?;
        self.log
            .emit(&format!("Initial database version is {version}"));

        {
            let mut inner = self.lock()?;
            inner.engine = Some(engine);
            inner.state = SessionState::NotReady;
            inner.current_version = version;
        }

        if reset {
            self.drop_and_rebuild_sync()
        } else {
            self.upgrade_sync()
        }
    }

    fn upgrade_sync(&self) -> Result<UpgradeReport> {
        let mut guard = self.lock()?;
        let Inner {
            engine,
            state,
            current_version,
        } = &mut *guard;
        let engine = engine
            .as_mut()
            .ok_or_else(|| Error::NotOpen(self.database_name.clone()))?;

        let from = *current_version;
        let Some(to) = self.target_version else {
            *state = SessionState::Ready;
            return Ok(UpgradeReport::unchanged(from));
        };
        if from > to {
            *state = SessionState::Failed;
            return Err(Error::UnsupportedVersion {
                current: from,
                target: to,
            });
        }

        *state = SessionState::Upgrading;
        let migrations = self
            .catalog
            .as_ref()
            .map(|catalog| catalog.applicable(from, to))
            .unwrap_or_default();
        let applied: Vec<u32> = migrations.iter().map(|m| m.version).collect();
        info!(
            database = %self.database_name,
            from,
            to,
            migrations = applied.len(),
            "upgrading schema"
        );

        let result = self.run_transaction(
            engine,
            Some("Upgrade Database"),
            TransactionMode::Schema,
            Some(VersionChange { from, to }),
            |tx, logger| {
                logger.log_line(format_args!("Migrating from {from} to {to}"));
                for migration in &migrations {
                    let statements = normalize(migration.sql.clone());
                    execute_all(tx, logger, &statements, |_, _, _| {});
                }
            },
        );

        match result {
            Ok(()) => {
                *state = SessionState::Ready;
                *current_version = to;
                Ok(UpgradeReport {
                    from,
                    to,
                    applied,
                    dropped: Vec::new(),
                })
            }
            Err(err) => {
                *state = SessionState::Failed;
                Err(err)
            }
        }
    }

    fn drop_and_rebuild_sync(&self) -> Result<UpgradeReport> {
        self.log
            .emit("Dropping data and setting database back to initial state");

        let objects = match self.run_query_sync(SqlInput::from(E::SCHEMA_OBJECTS_SQL)) {
            Ok(rows) => rows,
            Err(err) => {
                if !matches!(err, Error::NotOpen(_)) {
                    self.lock_state().state = SessionState::Failed;
                }
                return Err(err);
            }
        };

        let mut views = Vec::new();
        let mut tables = Vec::new();
        for row in &objects {
            let kind = row.get("type").and_then(|value| value.as_str());
            let name = row.get("name").and_then(|value| value.as_str());
            let (Some(kind), Some(name)) = (kind, name) else {
                continue;
            };
            if is_internal_table(name) {
                continue;
            }
            match kind {
                "view" => views.push(name),
                "table" => tables.push(name),
                _ => {}
            }
        }

        // Views before tables, newest first within each, so dependents go
        // before what they reference.
        let ordered: Vec<(&str, &str)> = views
            .iter()
            .rev()
            .map(|name| ("VIEW", *name))
            .chain(tables.iter().rev().map(|name| ("TABLE", *name)))
            .collect();
        let drops: Vec<Statement> = ordered
            .iter()
            .map(|(kind, name)| Statement::new(format!("DROP {kind} {}", quote_identifier(name))))
            .collect();
        let dropped: Vec<String> = ordered.iter().map(|(_, name)| name.to_string()).collect();

        let from = {
            let mut guard = self.lock()?;
            let Inner {
                engine,
                state,
                current_version,
            } = &mut *guard;
            let engine = engine
                .as_mut()
                .ok_or_else(|| Error::NotOpen(self.database_name.clone()))?;

            let from = *current_version;
            let result = self.run_transaction(
                engine,
                Some("Drop data"),
                TransactionMode::Schema,
                Some(VersionChange { from, to: 0 }),
                |tx, logger| execute_all(tx, logger, &drops, |_, _, _| {}),
            );
            if let Err(err) = result {
                *state = SessionState::Failed;
                return Err(err);
            }
            *current_version = 0;
            from
        };

        let report = self.upgrade_sync()?;
        Ok(UpgradeReport {
            from,
            dropped,
            ..report
        })
    }

    fn run_update_sync(&self, sql: SqlInput) -> Result<()> {
        let statements = normalize(sql);
        self.with_engine(|engine| {
            self.run_transaction(engine, None, TransactionMode::Write, None, |tx, logger| {
                execute_all(tx, logger, &statements, |_, _, _| {});
            })
        })
    }

    fn run_insert_sync(&self, sql: SqlInput) -> Result<InsertOutcome> {
        let batch = sql.is_batch();
        let statements = normalize(sql);
        let follow_up = [Statement::new(E::LAST_INSERT_ID_SQL)];

        let ids = self.with_engine(|engine| {
            self.run_transaction(engine, None, TransactionMode::Write, None, |tx, logger| {
                let mut ids = Vec::with_capacity(statements.len());
                execute_all(tx, logger, &statements, |tx, logger, _| {
                    execute_all(tx, logger, &follow_up, |_, logger, outcome| {
                        match outcome.rows.first().and_then(|row| row.get("id")?.as_i64()) {
                            Some(id) => ids.push(id),
                            None => logger.record(
                                E::LAST_INSERT_ID_SQL,
                                &EngineError::new("no row id returned"),
                            ),
                        }
                    });
                });
                ids
            })
        })?;

        if batch {
            return Ok(InsertOutcome::Batch(ids));
        }
        ids.first()
            .copied()
            .map(InsertOutcome::Single)
            .ok_or_else(|| Error::Database("insert returned no row id".into()))
    }

    fn run_query_sync(&self, sql: SqlInput) -> Result<Vec<Row>> {
        let statements = normalize(sql);
        self.with_engine(|engine| {
            self.run_transaction(engine, None, TransactionMode::Read, None, |tx, logger| {
                let mut rows = Vec::new();
                execute_all(tx, logger, &statements, |_, _, outcome| {
                    rows.extend(outcome.rows);
                });
                rows
            })
        })
    }

    /// Runs `body` in one engine transaction and resolves it exactly once:
    /// committed and logged "completed", or rolled back, logged "aborted",
    /// and handed to the failure handler.
    fn run_transaction<T>(
        &self,
        engine: &mut E,
        name: Option<&str>,
        mode: TransactionMode,
        version_change: Option<VersionChange>,
        body: impl FnOnce(&mut dyn EngineTransaction, &mut TransactionLogger<'_>) -> T,
    ) -> Result<T> {
        let mut logger = TransactionLogger::new(&self.log, name);

        let mut tx = match engine.begin(mode) {
            Ok(tx) => tx,
            Err(err) => {
                logger.record("BEGIN", &err);
                return Err(self.fail(logger));
            }
        };

        if let Some(change) = version_change {
            let checked = tx.version().and_then(|found| {
                if found == change.from {
                    Ok(())
                } else {
                    Err(EngineError::new(format!(
                        "expected schema version {}, found {found}",
                        change.from
                    )))
                }
            });
            if let Err(err) = checked {
                logger.record("version check", &err);
                drop(tx);
                return Err(self.fail(logger));
            }
        }

        let value = body(&mut *tx, &mut logger);

        if !logger.has_errors() {
            if let Some(change) = version_change {
                if let Err(err) = tx.set_version(change.to) {
                    logger.record("version change", &err);
                }
            }
        }
        if logger.has_errors() {
            drop(tx);
            return Err(self.fail(logger));
        }

        if let Err(err) = tx.commit() {
            logger.record("COMMIT", &err);
            return Err(self.fail(logger));
        }

        logger.completed();
        Ok(value)
    }

    fn fail(&self, logger: TransactionLogger<'_>) -> Error {
        (self.on_failure)(logger.aborted())
    }

    fn with_engine<T>(&self, f: impl FnOnce(&mut E) -> Result<T>) -> Result<T> {
        let mut inner = self.lock()?;
        let engine = inner
            .engine
            .as_mut()
            .ok_or_else(|| Error::NotOpen(self.database_name.clone()))?;
        f(engine)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<E>>> {
        self.inner
            .lock()
            .map_err(|_| Error::Database(format!("database {} lock poisoned", self.database_name)))
    }

    fn lock_state(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Executes `statements` in order. A rejected statement is logged and
/// recorded on `logger`; the rest still run so the failure report lists
/// every error, and the caller rolls the transaction back.
fn execute_all(
    tx: &mut dyn EngineTransaction,
    logger: &mut TransactionLogger<'_>,
    statements: &[Statement],
    mut on_result: impl FnMut(&mut dyn EngineTransaction, &mut TransactionLogger<'_>, StatementOutcome),
) {
    for statement in statements {
        logger.log_line(statement);
        match tx.execute(statement) {
            Ok(outcome) => on_result(&mut *tx, &mut *logger, outcome),
            Err(err) => logger.statement_error(&statement.sql, &err),
        }
    }
}

fn is_internal_table(name: &str) -> bool {
    name.starts_with("__") || name.to_ascii_lowercase().starts_with("sqlite_")
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Transaction entry points of a session, for callers that hold it as a trait object.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn run_update(&self, sql: SqlInput) -> Result<()>;
    async fn run_insert(&self, sql: SqlInput) -> Result<InsertOutcome>;
    async fn run_query(&self, sql: SqlInput) -> Result<Vec<Row>>;
}

#[async_trait]
impl<E: Engine> SqlExecutor for Session<E> {
    async fn run_update(&self, sql: SqlInput) -> Result<()> {
        self.run_update(sql).await
    }

    async fn run_insert(&self, sql: SqlInput) -> Result<InsertOutcome> {
        self.run_insert(sql).await
    }

    async fn run_query(&self, sql: SqlInput) -> Result<Vec<Row>> {
        self.run_query(sql).await
    }
}
