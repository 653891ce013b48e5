//! SQLite persistence: sessions and their append-only event logs.

pub mod database;
pub mod error;
pub mod events;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use crate::database::Database;
pub use crate::error::StoreError;
