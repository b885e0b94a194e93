use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sql::SqlInput;

/// Highest storable schema version; engines keep it in a signed 32-bit slot.
pub const MAX_VERSION: u32 = i32::MAX as u32;

/// SQL that upgrades the schema to `version`.
///
/// Versions order the upgrade path: a migration tagged N runs once when the
/// stored version moves from below N to N or above, and never again after.
/// ```text
/// migrations:
///   - version: 1
///     sql: CREATE TABLE users (id INTEGER UNIQUE, name TEXT)
///   - version: 2
///     sql:
///       - ALTER TABLE users ADD COLUMN email TEXT
///       - sql: INSERT INTO users (id, name) VALUES (?, ?)
///         params: [0, "admin"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub version: u32,
    pub sql: SqlInput,
}

impl Migration {
    pub fn new(version: u32, sql: impl Into<SqlInput>) -> Self {
        Self {
            version,
            sql: sql.into(),
        }
    }
}

/// Fails with `VersionOutOfRange` for a version the engine cannot store.
pub fn check_version(version: u32) -> Result<u32> {
    if version > MAX_VERSION {
        return Err(Error::VersionOutOfRange(version));
    }
    Ok(version)
}
