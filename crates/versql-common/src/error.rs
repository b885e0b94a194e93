use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open the database: {0}")]
    ConnectionFailed(String),

    #[error("no migrations and no explicit schema version given")]
    EmptyCatalog,

    #[error("database schema version {current} is newer than target {target}")]
    UnsupportedVersion { current: u32, target: u32 },

    #[error("schema version {0} exceeds the maximum of {max}", max = i32::MAX)]
    VersionOutOfRange(u32),

    #[error("transaction {sequence}. {name} aborted: {errors}")]
    TransactionAborted {
        sequence: u64,
        name: String,
        errors: String,
    },

    #[error("{0}")]
    Fatal(String),

    #[error("database {0} is not open")]
    NotOpen(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
