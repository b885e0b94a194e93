pub mod error;
pub mod migration;
pub mod sql;

pub use error::{Error, Result};
pub use migration::{MAX_VERSION, Migration, check_version};
pub use sql::{SqlInput, Statement, Value, normalize};
