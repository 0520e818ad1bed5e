//! Backup engine.
//!
//! A run localizes every target directory of an instance into a
//! content-addressed mirror tree, writes the manifest, pulls a database dump
//! when the application has one, normalizes permissions, and finally seals
//! everything into one archive. Failures during localization are collected
//! across all targets before the run is declared failed, so the operator sees
//! the full damage in one report.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use rusqlite::Connection;

use crate::access::{Access, Capability};
use crate::app::Application;
use crate::archive;
use crate::config::Config;
use crate::error::{BackupError, CopyFailures};
use crate::manifest::{self, ManifestEntry, TargetType};
use crate::models::instance::{self, Instance};
use crate::perms::FilePolicy;
use crate::services::DATABASE_DUMP;

/// Where a run stopped. Terminal states are `Archived` (or `DatabaseDumped`
/// when archiving was skipped) and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Init,
    DirectoriesLocalized,
    ManifestWritten,
    DatabaseDumped,
    Archived,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackupOptions {
    /// Stop after the mirror tree is complete instead of producing an
    /// archive. Useful for frequent low-cost runs between archived ones.
    pub skip_archive: bool,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct BackupOutcome {
    pub backup_dir: PathBuf,
    pub entries: Vec<ManifestEntry>,
    pub archive: Option<PathBuf>,
}

pub struct BackupEngine {
    config: Config,
    state: BackupState,
}

impl BackupEngine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: BackupState::Init,
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    pub fn run(
        &mut self,
        conn: &Connection,
        instance: &Instance,
        app: &dyn Application,
        options: &BackupOptions,
    ) -> Result<BackupOutcome, BackupError> {
        self.state = BackupState::Init;
        match self.execute(conn, instance, app, options) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.state = BackupState::Failed;
                Err(e)
            }
        }
    }

    fn execute(
        &mut self,
        conn: &Connection,
        instance: &Instance,
        app: &dyn Application,
        options: &BackupOptions,
    ) -> Result<BackupOutcome, BackupError> {
        let dirname = archive::backup_dirname(instance.id, &instance.name);
        let backup_dir = self.config.backup_root.join(&dirname);
        std::fs::create_dir_all(&backup_dir)?;

        tracing::info!(instance = instance.id, dir = %backup_dir.display(), "starting backup");

        let transfer = Access::best_for(instance, Capability::FileTransfer, conn, &self.config)?;
        let scripting = Access::best_for(instance, Capability::Scripting, conn, &self.config)
            .map_err(|e| {
                tracing::debug!(instance = instance.id, error = %e, "no scripting access");
                e
            })
            .ok();

        if let Some(scripting) = &scripting {
            let cmd = scripting
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .sh(&format!("mkdir -p {}", crate::command::sh_quote(&instance.tempdir)))?;
            if !cmd.succeeded() {
                tracing::warn!(
                    instance = instance.id,
                    dir = instance.tempdir,
                    "could not create work directory"
                );
            }
            app.remove_temporary_files(instance, scripting)?;
        }

        // Localize every target, collecting failures rather than aborting on
        // the first one.
        let entries = self.targets(conn, instance, app)?;
        let mut failures = CopyFailures::default();
        for entry in &entries {
            let mirror = backup_dir.join(&entry.hash);
            std::fs::create_dir_all(&mirror)?;
            let code = transfer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .localize_directory(&entry.original_path, &mirror)?;
            if code != 0 {
                tracing::warn!(
                    path = entry.original_path,
                    code,
                    "directory localization reported failure"
                );
                failures.record(code, &entry.original_path);
            }
        }
        if !failures.is_empty() {
            return Err(BackupError::CopyFailed(failures));
        }
        self.state = BackupState::DirectoriesLocalized;

        manifest::write(&entries, &backup_dir)?;
        self.state = BackupState::ManifestWritten;

        // A dump from an earlier run must never survive into this one.
        let dump_path = backup_dir.join(DATABASE_DUMP);
        if dump_path.exists() {
            std::fs::remove_file(&dump_path)?;
        }
        if let Some(scripting) = &scripting {
            if let Some(remote_dump) = app.backup_database(instance, scripting)? {
                transfer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .download(&remote_dump, &dump_path)?;
            }
        }
        self.state = BackupState::DatabaseDumped;

        let policy = FilePolicy::for_instance(conn, instance.id)?;
        policy.fix(&backup_dir)?;

        let archive = if options.skip_archive {
            None
        } else {
            let created = archive::create(
                &self.config.backup_root,
                &dirname,
                &self.config.archive_root.join(&dirname),
                chrono::Local::now().naive_local(),
            )?;
            std::fs::set_permissions(
                &created,
                std::fs::Permissions::from_mode(policy.mode_for_file()),
            )?;
            self.state = BackupState::Archived;
            Some(created)
        };

        tracing::info!(
            instance = instance.id,
            targets = entries.len(),
            archived = archive.is_some(),
            "backup complete"
        );
        Ok(BackupOutcome {
            backup_dir,
            entries,
            archive,
        })
    }

    /// Application directories plus instance-level extra locations. Extra
    /// locations are always treated as data.
    fn targets(
        &self,
        conn: &Connection,
        instance: &Instance,
        app: &dyn Application,
    ) -> anyhow::Result<Vec<ManifestEntry>> {
        let mut entries: Vec<ManifestEntry> = app
            .file_locations(instance)
            .into_iter()
            .map(|(target_type, path)| ManifestEntry::new(target_type, path))
            .collect();
        for path in instance::extra_backups(conn, instance.id)? {
            let entry = ManifestEntry::new(TargetType::Data, path);
            if !entries.iter().any(|e| e.hash == entry.hash) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
