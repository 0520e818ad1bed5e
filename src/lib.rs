//! Instance Manager Core
//!
//! Manages a fleet of remote application installations ("instances") reachable
//! over heterogeneous transports (local shell, SSH, FTP), and runs backup,
//! restore and drift-detection operations against each of them.

pub mod access;
pub mod app;
pub mod archive;
pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod logging;
pub mod manifest;
pub mod models;
pub mod perms;
pub mod services;

// Re-export commonly used types
pub use access::{Access, Capability, CapabilitySet};
pub use command::Command;
pub use config::Config;
pub use error::{BackupError, RestoreError, TransportError};
pub use manifest::{ManifestEntry, TargetType};
pub use models::instance::Instance;
pub use models::version::Version;
pub use services::backup::{BackupEngine, BackupOptions, BackupState};
pub use services::checksum::{ChecksumEngine, DriftReport};
pub use services::restore::{RestoreEngine, RestoreStep};
