//! The three engines that act on instances: backup, restore and checksum
//! drift detection. Each engine operates on exactly one instance per call;
//! callers iterate their fleet sequentially.

pub mod backup;
pub mod checksum;
pub mod restore;

/// Name of the database dump file inside a backup directory and its archive.
pub const DATABASE_DUMP: &str = "database_dump.sql";
