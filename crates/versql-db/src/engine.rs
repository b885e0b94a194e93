//! The transactional SQL engine a [`Session`](crate::Session) drives.
//!
//! The session never talks to SQLite directly: it opens a connection, reads
//! and writes the stored schema version, and runs statements inside
//! transactions through these two traits. [`SqliteEngine`](crate::SqliteEngine)
//! is the shipped implementation.

use std::fmt;
use std::path::{Path, PathBuf};

use versql_common::Statement;

/// A result row keyed by column name, as named in the SELECT.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    File(PathBuf),
    Memory,
}

impl DatabaseTarget {
    /// `<dir>/<name>.db`
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self::File(dir.join(format!("{name}.db")))
    }
}

impl fmt::Display for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Memory => write!(f, ":memory:"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    Read,
    Write,
    /// Changes the schema and the stored version.
    Schema,
}

/// Failure reported by the engine for a connection, statement, or transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub message: String,
    pub code: Option<i32>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for EngineError {}

/// What a single statement produced.
#[derive(Debug, Clone, Default)]
pub struct StatementOutcome {
    pub rows: Vec<Row>,
    pub changes: u64,
}

pub trait Engine: Send + Sized {
    /// System-catalog query returning `type` (`view` or `table`) and `name`
    /// columns, one row per object, in creation order.
    const SCHEMA_OBJECTS_SQL: &'static str;

    /// Follow-up query returning the last inserted row id as column `id`.
    const LAST_INSERT_ID_SQL: &'static str;

    fn connect(target: &DatabaseTarget) -> Result<Self, EngineError>;

    /// Stored schema version; 0 for a database that never had one.
    fn version(&self) -> Result<u32, EngineError>;

    fn begin(
        &mut self,
        mode: TransactionMode,
    ) -> Result<Box<dyn EngineTransaction + '_>, EngineError>;
}

/// An open transaction. Dropping it without [`commit`](Self::commit) rolls back.
pub trait EngineTransaction {
    fn version(&self) -> Result<u32, EngineError>;

    /// Takes effect only if the transaction commits.
    fn set_version(&mut self, version: u32) -> Result<(), EngineError>;

    fn execute(&mut self, statement: &Statement) -> Result<StatementOutcome, EngineError>;

    fn commit(self: Box<Self>) -> Result<(), EngineError>;
}
