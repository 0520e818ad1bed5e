//! Application adapters.
//!
//! An [`Application`] describes the pieces of one installed product the
//! engines need to know about: which directories hold its code and data, how
//! to dump and reload its database, and how to clean its caches. Engines only
//! ever talk to the trait, so new products slot in without touching them.

use std::sync::{Arc, Mutex};

use crate::access::Access;
use crate::manifest::{ManifestEntry, TargetType};
use crate::models::instance::Instance;

pub trait Application: Send {
    fn name(&self) -> &str;

    /// Directories to back up, as (type, remote path) pairs. The first App
    /// entry is expected to be the web root.
    fn file_locations(&self, instance: &Instance) -> Vec<(TargetType, String)>;

    /// Produce a database dump on the endpoint and return its remote path,
    /// or None when the application has no database.
    fn backup_database(
        &self,
        instance: &Instance,
        access: &Arc<Mutex<Access>>,
    ) -> anyhow::Result<Option<String>>;

    /// Drop caches and scratch files ahead of a backup or restore. Optional.
    fn remove_temporary_files(
        &self,
        _instance: &Instance,
        _access: &Arc<Mutex<Access>>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Re-apply the product's expected remote permissions after files moved.
    /// Optional.
    fn fix_permissions(
        &self,
        _instance: &Instance,
        _access: &Arc<Mutex<Access>>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_installed(&self, instance: &Instance, access: &Arc<Mutex<Access>>)
        -> anyhow::Result<bool>;
}

/// Database side of an application, exercised during restore.
pub trait DatabaseSetup: Send {
    /// Load the dump at `dump` (a path on the endpoint) into the instance's
    /// database.
    fn reload(
        &self,
        instance: &Instance,
        access: &Arc<Mutex<Access>>,
        dump: &str,
    ) -> anyhow::Result<()>;
}

/// Maps a manifest entry to the remote path it should be restored to.
/// The default keeps every entry at its recorded location; cross-instance
/// restores override this to relocate the app directory.
pub trait DestinationResolver {
    fn resolve(&self, entry: &ManifestEntry, default: &str) -> String {
        let _ = entry;
        default.to_string()
    }
}

/// Restore-in-place resolver.
#[derive(Debug, Default)]
pub struct SameLocation;

impl DestinationResolver for SameLocation {}
