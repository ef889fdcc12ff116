pub mod error;
pub mod models;
pub mod sqlite;
pub mod store;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use error::{DbError, DbResult};
pub use sqlite::SqliteStore;
pub use store::Store;
