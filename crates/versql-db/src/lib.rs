pub mod engine;
pub mod migrations;
pub mod session;
pub mod sqlite;
pub mod transaction;

pub use engine::{
    DatabaseTarget, Engine, EngineError, EngineTransaction, Row, StatementOutcome,
    TransactionMode,
};
pub use migrations::MigrationCatalog;
pub use session::{
    FailureHandler, InsertOutcome, Session, SessionState, SqlExecutor, UpgradeReport,
    default_failure_handler, report_aborted,
};
pub use sqlite::SqliteEngine;
pub use transaction::{LogSink, SessionLog, StatementError, TransactionFailure, TransactionLogger};
