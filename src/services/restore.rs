//! Restore engine.
//!
//! Replays one archive onto an instance: the archive is pushed to the
//! endpoint and unpacked there, each manifest record is relocated into place
//! with mirror semantics, the database dump is reloaded, and a new version
//! row records the event together with a fresh checksum baseline. Steps run
//! strictly in order; a failed step aborts the rest and is reported by name,
//! with nothing rolled back.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::access::{Access, Capability};
use crate::app::{Application, DatabaseSetup, DestinationResolver};
use crate::archive;
use crate::command::sh_quote;
use crate::config::Config;
use crate::error::RestoreError;
use crate::manifest::{self, ManifestEntry, TargetType};
use crate::models::instance::{self, Instance};
use crate::models::version::{self, NewVersion, Version};
use crate::services::{checksum, DATABASE_DUMP};

/// Ordered steps of a restore run, used for failure reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    SelectArchive,
    Extract,
    ReadManifest,
    CopyFiles,
    AssignApplication,
    ReloadDatabase,
    RecordVersion,
    FixPermissions,
    CollectChecksums,
    Cleanup,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreStep::SelectArchive => "select archive",
            RestoreStep::Extract => "extract",
            RestoreStep::ReadManifest => "read manifest",
            RestoreStep::CopyFiles => "copy files",
            RestoreStep::AssignApplication => "assign application",
            RestoreStep::ReloadDatabase => "reload database",
            RestoreStep::RecordVersion => "record version",
            RestoreStep::FixPermissions => "fix permissions",
            RestoreStep::CollectChecksums => "collect checksums",
            RestoreStep::Cleanup => "cleanup",
        })
    }
}

/// Files never overwritten when relocating an application directory: they
/// carry endpoint-specific configuration the archive's copies would clobber.
const APP_PRESERVED: &[&str] = &[".htaccess", "db/local.php"];

pub struct RestoreEngine {
    config: Config,
}

impl RestoreEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Restore `archive_path` onto `instance`, which the caller has verified
    /// to be blank. Returns the version row recorded for the restored state.
    pub fn run(
        &self,
        conn: &mut Connection,
        instance: &mut Instance,
        app: &dyn Application,
        db_setup: Option<&dyn DatabaseSetup>,
        resolver: &dyn DestinationResolver,
        archive_path: &Path,
    ) -> Result<Version, RestoreError> {
        let instance_id = instance.id;
        let fail = move |step: RestoreStep| {
            move |source: anyhow::Error| RestoreError {
                step,
                instance: instance_id,
                source,
            }
        };

        if !archive_path.is_file() {
            return Err(fail(RestoreStep::SelectArchive)(anyhow::anyhow!(
                "archive {} does not exist",
                archive_path.display()
            )));
        }
        let base_dir =
            archive::base_dir_name(archive_path).map_err(fail(RestoreStep::SelectArchive))?;

        tracing::info!(
            instance = instance.id,
            archive = %archive_path.display(),
            "starting restore"
        );

        let access = Access::best_for(instance, Capability::Scripting, conn, &self.config)
            .map_err(fail(RestoreStep::Extract))?;
        let scratch_root = instance.work_path("restore");
        let remote_archive = self
            .push_and_extract(instance, &access, archive_path, &scratch_root)
            .map_err(fail(RestoreStep::Extract))?;

        let entries = self
            .read_manifest(archive_path, &base_dir)
            .map_err(fail(RestoreStep::ReadManifest))?;
        let extracted = format!("{scratch_root}/{base_dir}");

        for entry in &entries {
            self.relocate(instance, &access, resolver, &extracted, entry)
                .map_err(fail(RestoreStep::CopyFiles))?;
        }

        instance.app = Some(app.name().to_string());
        instance::update(conn, instance).map_err(fail(RestoreStep::AssignApplication))?;

        let remote_dump = format!("{extracted}/{DATABASE_DUMP}");
        let dump_present = access
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .file_exists(&remote_dump)
            .map_err(|e| fail(RestoreStep::ReloadDatabase)(e.into()))?;
        if dump_present {
            match db_setup {
                Some(setup) => setup
                    .reload(instance, &access, &remote_dump)
                    .map_err(fail(RestoreStep::ReloadDatabase))?,
                None => tracing::warn!(
                    instance = instance.id,
                    "archive carries a database dump but no database setup was provided"
                ),
            }
        }

        // Record the restored state as a fresh version, inheriting the
        // provenance of whatever was installed before. Best effort only:
        // the instance was blank, so a prior version may not exist.
        let prior = version::latest_for_instance(conn, instance.id)
            .map_err(fail(RestoreStep::RecordVersion))?;
        let data = match &prior {
            Some(v) => NewVersion::inheriting(v),
            None => NewVersion::default(),
        };
        let recorded = version::create(conn, instance.id, &data)
            .map_err(fail(RestoreStep::RecordVersion))?;

        app.fix_permissions(instance, &access)
            .map_err(fail(RestoreStep::FixPermissions))?;

        // Baseline from the now-populated tree, so drift checks measure
        // against what was actually restored.
        let live = checksum::enumerate_via(&access, &instance.webroot)
            .map_err(fail(RestoreStep::CollectChecksums))?;
        version::replace_file_map(conn, recorded.id, &live)
            .map_err(fail(RestoreStep::CollectChecksums))?;

        self.cleanup(&access, &scratch_root, &remote_archive)
            .map_err(fail(RestoreStep::Cleanup))?;

        tracing::info!(
            instance = instance.id,
            version = recorded.id,
            entries = entries.len(),
            "restore complete"
        );
        Ok(recorded)
    }

    /// Upload the archive to the endpoint's work directory and unpack it
    /// under the remote restore scratch tree.
    fn push_and_extract(
        &self,
        instance: &Instance,
        access: &Arc<Mutex<Access>>,
        archive_path: &Path,
        scratch_root: &str,
    ) -> anyhow::Result<String> {
        let file_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("archive path has no file name"))?;
        let remote_archive = instance.work_path(&file_name);

        let mut access = access.lock().unwrap_or_else(|e| e.into_inner());
        let prep = access.sh(&format!("mkdir -p {}", sh_quote(scratch_root)))?;
        if !prep.succeeded() {
            anyhow::bail!("could not create {scratch_root}: {}", prep.stderr().trim());
        }
        access.upload(archive_path, &remote_archive)?;

        let cmd = access.sh(&format!(
            "tar -xjpf {} -C {}",
            sh_quote(&remote_archive),
            sh_quote(scratch_root)
        ))?;
        if !cmd.succeeded() {
            anyhow::bail!(
                "remote extraction of {file_name} exited with {}: {}",
                cmd.status().unwrap_or(-1),
                cmd.stderr().trim()
            );
        }
        Ok(remote_archive)
    }

    /// Pull only the manifest out of the archive, locally, to learn the
    /// recorded triples without unpacking the whole stream a second time.
    /// The scratch path is per backup directory so concurrent restores of
    /// different instances sharing one config never collide.
    fn read_manifest(&self, archive_path: &Path, base_dir: &str) -> anyhow::Result<Vec<ManifestEntry>> {
        let scratch = self.config.temp_dir.join(format!("manifest-{base_dir}"));
        let text = archive::extract_manifest(archive_path, base_dir, &scratch)?;
        let _ = std::fs::remove_dir_all(&scratch);

        let entries = manifest::parse(&text);
        if entries.is_empty() {
            anyhow::bail!(
                "manifest in {} names no directories",
                archive_path.display()
            );
        }
        Ok(entries)
    }

    /// Relocate one record from the remote scratch tree into its destination
    /// with mirror semantics. App records always land in the target's web
    /// root; data records go to the recorded path unless overridden.
    fn relocate(
        &self,
        instance: &Instance,
        access: &Arc<Mutex<Access>>,
        resolver: &dyn DestinationResolver,
        extracted: &str,
        entry: &ManifestEntry,
    ) -> anyhow::Result<()> {
        let destination = match entry.target_type {
            TargetType::App => instance.webroot.clone(),
            TargetType::Data => resolver.resolve(entry, &entry.original_path),
        };
        let source = format!("{extracted}/{}/{}", entry.hash, entry.basename());

        let mut line = String::from("rsync -a --delete");
        if entry.target_type == TargetType::App {
            for preserved in APP_PRESERVED {
                line.push_str(&format!(" --exclude {}", sh_quote(preserved)));
            }
        }
        line.push_str(&format!(
            " {}/ {}/",
            sh_quote(&source),
            sh_quote(destination.trim_end_matches('/'))
        ));

        let mut access = access.lock().unwrap_or_else(|e| e.into_inner());
        let mkdir = access.sh(&format!("mkdir -p {}", sh_quote(&destination)))?;
        if !mkdir.succeeded() {
            anyhow::bail!("could not create {destination}: {}", mkdir.stderr().trim());
        }
        let cmd = access.sh(&line)?;
        if !cmd.succeeded() {
            anyhow::bail!(
                "relocating {} to {} exited with {}: {}",
                entry.original_path,
                destination,
                cmd.status().unwrap_or(-1),
                cmd.stderr().trim()
            );
        }
        Ok(())
    }

    /// Drop the remote scratch tree and the uploaded archive.
    fn cleanup(
        &self,
        access: &Arc<Mutex<Access>>,
        scratch_root: &str,
        remote_archive: &str,
    ) -> anyhow::Result<()> {
        let cmd = access
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sh(&format!(
                "rm -rf {} {}",
                sh_quote(scratch_root),
                sh_quote(remote_archive)
            ))?;
        if !cmd.succeeded() {
            anyhow::bail!(
                "removing scratch {} failed: {}",
                scratch_root,
                cmd.stderr().trim()
            );
        }
        Ok(())
    }
}
