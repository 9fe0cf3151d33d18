//! Storage backends for shapes-memory

mod sqlite;

pub use sqlite::SqliteStorage;
