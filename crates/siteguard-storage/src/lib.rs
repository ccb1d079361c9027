//! SiteGuard Storage Layer
//!
//! SQLite-based persistence for the declared blocklist and runtime state.
//! Every write is transactional: a multi-key `set` commits all keys or none.

mod database;
mod error;
mod migrations;
mod store;

pub use database::Database;
pub use error::StorageError;
pub use store::{keys, Namespace, StateStore, StorageChange};

pub type Result<T> = std::result::Result<T, StorageError>;
