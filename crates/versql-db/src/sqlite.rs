use rusqlite::types::ValueRef;
use rusqlite::{Connection, TransactionBehavior, params_from_iter};
use tracing::info;
use versql_common::{Statement, Value};

use crate::engine::{
    DatabaseTarget, Engine, EngineError, EngineTransaction, Row, StatementOutcome,
    TransactionMode,
};

/// SQLite through rusqlite; the schema version lives in `PRAGMA user_version`.
pub struct SqliteEngine {
    conn: Connection,
}

impl Engine for SqliteEngine {
    const SCHEMA_OBJECTS_SQL: &'static str =
        "SELECT type, name FROM sqlite_master WHERE type IN ('view', 'table')";
    const LAST_INSERT_ID_SQL: &'static str = "SELECT last_insert_rowid() AS id";

    fn connect(target: &DatabaseTarget) -> Result<Self, EngineError> {
        let conn = match target {
            DatabaseTarget::File(path) => {
                info!("opening database at {}", path.display());
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                conn
            }
            DatabaseTarget::Memory => Connection::open_in_memory()?,
        };

        Ok(Self { conn })
    }

    fn version(&self) -> Result<u32, EngineError> {
        read_version(&self.conn)
    }

    fn begin(
        &mut self,
        mode: TransactionMode,
    ) -> Result<Box<dyn EngineTransaction + '_>, EngineError> {
        let behavior = match mode {
            TransactionMode::Read => TransactionBehavior::Deferred,
            TransactionMode::Write => TransactionBehavior::Immediate,
            TransactionMode::Schema => TransactionBehavior::Exclusive,
        };
        let tx = self.conn.transaction_with_behavior(behavior)?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

struct SqliteTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl EngineTransaction for SqliteTransaction<'_> {
    fn version(&self) -> Result<u32, EngineError> {
        read_version(&self.tx)
    }

    fn set_version(&mut self, version: u32) -> Result<(), EngineError> {
        let stored = i32::try_from(version).map_err(|_| {
            EngineError::new(format!("schema version {version} does not fit user_version"))
        })?;
        Ok(self.tx.pragma_update(None, "user_version", stored)?)
    }

    fn execute(&mut self, statement: &Statement) -> Result<StatementOutcome, EngineError> {
        let mut stmt = self.tx.prepare(&statement.sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut records = Vec::new();
        let mut rows = stmt.query(params_from_iter(statement.params.iter().map(to_sql_value)))?;
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (idx, name) in columns.iter().enumerate() {
                record.insert(name.clone(), to_json(row.get_ref(idx)?));
            }
            records.push(record);
        }
        drop(rows);
        drop(stmt);

        let changes = if columns.is_empty() {
            self.tx.changes() as u64
        } else {
            0
        };

        Ok(StatementOutcome {
            rows: records,
            changes,
        })
    }

    fn commit(self: Box<Self>) -> Result<(), EngineError> {
        Ok(self.tx.commit()?)
    }
}

// `user_version` is a signed 32-bit slot.
fn read_version(conn: &Connection) -> Result<u32, EngineError> {
    let stored: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(stored)
        .map_err(|_| EngineError::new(format!("stored schema version {stored} is negative")))
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(failure, message) => Self {
                message: message.unwrap_or_else(|| failure.to_string()),
                code: Some(failure.extended_code),
            },
            other => Self::new(other.to_string()),
        }
    }
}

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(v) => rusqlite::types::Value::Integer(*v),
        Value::Real(v) => rusqlite::types::Value::Real(*v),
        Value::Text(v) => rusqlite::types::Value::Text(v.clone()),
        Value::Blob(v) => rusqlite::types::Value::Blob(v.clone()),
    }
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(v) => v.into(),
        ValueRef::Real(v) => serde_json::Number::from_f64(v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
        ValueRef::Blob(bytes) => bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteEngine;
    use crate::engine::{DatabaseTarget, Engine, EngineTransaction, TransactionMode};
    use serde_json::json;
    use versql_common::Statement;

    fn memory_engine() -> SqliteEngine {
        SqliteEngine::connect(&DatabaseTarget::Memory).expect("failed to open in-memory engine")
    }

    #[test]
    fn fresh_database_reports_version_zero() {
        let engine = memory_engine();
        assert_eq!(engine.version().expect("version should read"), 0);
    }

    #[test]
    fn version_change_is_rolled_back_with_the_transaction() {
        let mut engine = memory_engine();

        {
            let mut tx = engine
                .begin(TransactionMode::Schema)
                .expect("begin should succeed");
            tx.set_version(5).expect("set_version should succeed");
            assert_eq!(tx.version().expect("version should read"), 5);
        }
        assert_eq!(engine.version().expect("version should read"), 0);

        let mut tx = engine
            .begin(TransactionMode::Schema)
            .expect("begin should succeed");
        tx.set_version(3).expect("set_version should succeed");
        tx.commit().expect("commit should succeed");
        assert_eq!(engine.version().expect("version should read"), 3);
    }

    #[test]
    fn versions_past_the_signed_limit_are_refused() {
        let mut engine = memory_engine();
        let mut tx = engine
            .begin(TransactionMode::Schema)
            .expect("begin should succeed");

        tx.set_version(i32::MAX as u32)
            .expect("i32::MAX should be storable");
        assert_eq!(tx.version().expect("version should read"), i32::MAX as u32);

        let err = tx
            .set_version(3_000_000_000)
            .expect_err("version past i32::MAX should be refused");
        assert!(err.message.contains("3000000000"));
        assert_eq!(tx.version().expect("version should read"), i32::MAX as u32);
    }

    #[test]
    fn execute_returns_rows_keyed_by_column() {
        let mut engine = memory_engine();
        let mut tx = engine
            .begin(TransactionMode::Write)
            .expect("begin should succeed");

        tx.execute(&Statement::new(
            "CREATE TABLE items (id INTEGER, label TEXT, weight REAL, raw BLOB)",
        ))
        .expect("create should succeed");
        let inserted = tx
            .execute(
                &Statement::new("INSERT INTO items VALUES (?, ?, ?, ?)")
                    .bind(1)
                    .bind("first")
                    .bind(0.5)
                    .bind(vec![1u8, 2]),
            )
            .expect("insert should succeed");
        assert_eq!(inserted.changes, 1);
        assert!(inserted.rows.is_empty());

        let selected = tx
            .execute(&Statement::new("SELECT id, label, weight, raw, NULL AS missing FROM items"))
            .expect("select should succeed");
        assert_eq!(selected.rows.len(), 1);
        assert_eq!(
            serde_json::Value::Object(selected.rows[0].clone()),
            json!({"id": 1, "label": "first", "weight": 0.5, "raw": [1, 2], "missing": null})
        );

        let id = tx
            .execute(&Statement::new(SqliteEngine::LAST_INSERT_ID_SQL))
            .expect("last insert id should succeed");
        assert_eq!(id.rows[0]["id"], json!(1));
    }

    #[test]
    fn constraint_violation_carries_engine_code() {
        let mut engine = memory_engine();
        let mut tx = engine
            .begin(TransactionMode::Write)
            .expect("begin should succeed");
        tx.execute(&Statement::new("CREATE TABLE u (id INTEGER UNIQUE)"))
            .expect("create should succeed");
        tx.execute(&Statement::new("INSERT INTO u VALUES (1)"))
            .expect("first insert should succeed");

        let err = tx
            .execute(&Statement::new("INSERT INTO u VALUES (1)"))
            .expect_err("duplicate insert should fail");
        assert!(err.message.contains("UNIQUE"));
        assert_eq!(err.code, Some(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE));
    }

    #[test]
    fn missing_directory_fails_to_connect() {
        let target = DatabaseTarget::File("/nonexistent-versql-dir/sub/db.db".into());
        assert!(SqliteEngine::connect(&target).is_err());
    }
}
