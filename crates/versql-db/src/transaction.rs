use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::engine::EngineError;

/// Receives every formatted transaction log line.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-session log state: the optional sink and the transaction counter.
#[derive(Default)]
pub struct SessionLog {
    sink: Option<LogSink>,
    sequence: AtomicU64,
}

impl SessionLog {
    pub fn new(sink: Option<LogSink>) -> Self {
        Self {
            sink,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn set_sink(&mut self, sink: LogSink) {
        self.sink = Some(sink);
    }

    pub fn emit(&self, line: &str) {
        debug!(target: "versql::tx", "{line}");
        if let Some(sink) = &self.sink {
            sink(line);
        }
    }

    /// Number of transactions started so far.
    pub fn transaction_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// A statement the engine rejected, as recorded for the failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementError {
    pub sequence: u64,
    pub sql: String,
    pub message: String,
    pub code: Option<i32>,
}

impl fmt::Display for StatementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.sequence, self.sql, self.message)?;
        if let Some(code) = self.code {
            write!(f, " ({code})")?;
        }
        Ok(())
    }
}

/// Everything recorded while an aborted transaction ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFailure {
    pub sequence: u64,
    pub name: String,
    pub errors: Vec<StatementError>,
}

impl TransactionFailure {
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

impl fmt::Display for TransactionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages().join("\n"))
    }
}

/// Sequence-numbered log trail for one transaction.
///
/// The terminal methods [`completed`](Self::completed) and
/// [`aborted`](Self::aborted) consume the logger, so a transaction reports
/// exactly one outcome.
pub struct TransactionLogger<'a> {
    log: &'a SessionLog,
    name: String,
    sequence: u64,
    errors: Vec<StatementError>,
}

impl<'a> TransactionLogger<'a> {
    pub fn new(log: &'a SessionLog, name: Option<&str>) -> Self {
        let logger = Self {
            log,
            name: name.unwrap_or("transaction").to_string(),
            sequence: log.next_sequence(),
            errors: Vec::new(),
        };
        log.emit(&format!("{}. {} started", logger.sequence, logger.name));
        logger
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_line(&self, message: impl fmt::Display) {
        self.log.emit(&format!("{}.   {message}", self.sequence));
    }

    pub fn on_complete(&self, message: &str) {
        self.log
            .emit(&format!("{}. {} {message}", self.sequence, self.name));
    }

    /// Logs a rejected statement and keeps it for the failure report.
    pub fn statement_error(&mut self, sql: &str, error: &EngineError) {
        self.log_line(format_args!("SQL Statement error on {sql}"));
        self.log_line(format_args!("  {}", error.message));
        self.record(sql, error);
    }

    /// Keeps an error that was not raised by a statement (begin, commit, version check).
    pub fn record(&mut self, what: &str, error: &EngineError) {
        self.errors.push(StatementError {
            sequence: self.sequence,
            sql: what.to_string(),
            message: error.message.clone(),
            code: error.code,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn completed(self) {
        self.on_complete("completed");
    }

    pub fn aborted(self) -> TransactionFailure {
        self.on_complete("aborted");
        warn!(
            sequence = self.sequence,
            name = %self.name,
            errors = self.errors.len(),
            "transaction aborted"
        );
        TransactionFailure {
            sequence: self.sequence,
            name: self.name,
            errors: self.errors,
        }
    }
}
