//! Archive naming, creation and inspection.
//!
//! One archive is a compressed tape file holding one backup directory tree,
//! named `<id>-<name>_<YYYY-MM-DD_HH-MM-SS>.tar.bz2`. Lexicographic order by
//! filename is also chronological order for one instance.

use std::path::{Path, PathBuf};

use crate::error::BackupError;

pub const ARCHIVE_EXTENSION: &str = ".tar.bz2";

/// `<id>-<name>`: the per-instance backup directory name and the top-level
/// directory inside every archive for that instance.
pub fn backup_dirname(instance_id: i64, instance_name: &str) -> String {
    format!("{instance_id}-{instance_name}")
}

pub fn archive_filename(
    instance_id: i64,
    instance_name: &str,
    timestamp: chrono::NaiveDateTime,
) -> String {
    format!(
        "{}_{}{}",
        backup_dirname(instance_id, instance_name),
        timestamp.format("%Y-%m-%d_%H-%M-%S"),
        ARCHIVE_EXTENSION
    )
}

/// Derive the archive's base directory name by stripping the timestamp
/// suffix: everything before the first underscore-delimited timestamp run.
/// This is also the top-level directory inside the tar stream.
pub fn base_dir_name(archive: &Path) -> anyhow::Result<String> {
    let file_name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("archive path has no file name: {}", archive.display()))?;

    for (idx, _) in file_name.match_indices('_') {
        if is_timestamp_run(&file_name[idx + 1..]) {
            return Ok(file_name[..idx].to_string());
        }
    }
    anyhow::bail!("no timestamp suffix in archive name '{file_name}'")
}

/// True when `s` starts with `YYYY-MM-DD_HH-MM-SS`.
fn is_timestamp_run(s: &str) -> bool {
    const PATTERN: &[u8] = b"dddd-dd-dd_dd-dd-dd";
    if s.len() < PATTERN.len() {
        return false;
    }
    s.bytes().zip(PATTERN).all(|(b, p)| match p {
        b'd' => b.is_ascii_digit(),
        _ => b == *p,
    })
}

/// Tar and compress the whole backup directory, by name, from its parent.
/// Compression runs at low scheduling priority; the result is verified to
/// exist and be non-empty before it is reported.
pub fn create(
    backup_root: &Path,
    dirname: &str,
    archive_dir: &Path,
    timestamp: chrono::NaiveDateTime,
) -> Result<PathBuf, BackupError> {
    std::fs::create_dir_all(archive_dir)?;
    let tar_path = archive_dir.join(format!(
        "{dirname}_{}{ARCHIVE_EXTENSION}",
        timestamp.format("%Y-%m-%d_%H-%M-%S")
    ));

    let output = std::process::Command::new("nice")
        .arg("-n")
        .arg("19")
        .arg("tar")
        .arg("-cjp")
        .arg("-C")
        .arg(backup_root)
        .arg("-f")
        .arg(&tar_path)
        .arg(dirname)
        .output()?;

    let exit_code = output.status.code().unwrap_or(-1);
    if exit_code != 0 {
        tracing::error!(
            code = exit_code,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "tar exited non-zero"
        );
    }

    let verified = exit_code == 0
        && tar_path
            .metadata()
            .map(|m| m.len() > 0)
            .unwrap_or(false);
    if !verified {
        return Err(BackupError::ArchiveVerification {
            path: tar_path,
            exit_code,
        });
    }
    Ok(tar_path)
}

/// Archives stored for one instance, newest first.
pub fn list_for_instance(archive_root: &Path, instance_id: i64) -> Vec<PathBuf> {
    let prefix = format!("{instance_id}-");
    let mut archives = Vec::new();

    let Ok(dirs) = std::fs::read_dir(archive_root) else {
        return archives;
    };
    for dir in dirs.filter_map(|e| e.ok()) {
        if !dir.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let Ok(files) = std::fs::read_dir(dir.path()) else {
            continue;
        };
        for file in files.filter_map(|e| e.ok()) {
            let name = file.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(ARCHIVE_EXTENSION) {
                archives.push(file.path());
            }
        }
    }

    archives.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    archives
}

/// Extract only the manifest file from an archive into `scratch` and return
/// its contents, without unpacking anything else.
pub fn extract_manifest(
    archive: &Path,
    base_dir: &str,
    scratch: &Path,
) -> anyhow::Result<String> {
    std::fs::create_dir_all(scratch)?;
    let member = format!("{base_dir}/{}", crate::manifest::MANIFEST_FILENAME);

    let output = std::process::Command::new("tar")
        .arg("-xjf")
        .arg(archive)
        .arg("-C")
        .arg(scratch)
        .arg(&member)
        .output()?;

    if !output.status.success() {
        anyhow::bail!(
            "manifest extraction from {} failed with {}: {}",
            archive.display(),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(std::fs::read_to_string(scratch.join(&member))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> chrono::NaiveDateTime {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_archive_naming() {
        let name = archive_filename(7, "mysite", ts("2024-03-01 10:00:00"));
        assert_eq!(name, "7-mysite_2024-03-01_10-00-00.tar.bz2");
    }

    #[test]
    fn test_base_dir_roundtrip() {
        let name = archive_filename(7, "mysite", ts("2024-03-01 10:00:00"));
        let base = base_dir_name(Path::new(&name)).unwrap();
        assert_eq!(base, "7-mysite");
    }

    #[test]
    fn test_base_dir_survives_underscores_in_name() {
        let base =
            base_dir_name(Path::new("12-my_site_2018-05-31_02-30-50.tar.bz2")).unwrap();
        assert_eq!(base, "12-my_site");
    }

    #[test]
    fn test_base_dir_rejects_names_without_timestamp() {
        assert!(base_dir_name(Path::new("7-mysite.tar.bz2")).is_err());
    }

    #[test]
    fn test_listing_is_newest_first() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("7-mysite");
        std::fs::create_dir_all(&dir).unwrap();
        for stamp in ["2024-03-01_10-00-00", "2024-01-15_08-30-00", "2024-02-20_23-59-59"] {
            std::fs::write(dir.join(format!("7-mysite_{stamp}.tar.bz2")), b"x").unwrap();
        }
        std::fs::write(dir.join("unrelated.txt"), b"x").unwrap();

        let archives = list_for_instance(temp.path(), 7);
        let names: Vec<String> = archives
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "7-mysite_2024-03-01_10-00-00.tar.bz2",
                "7-mysite_2024-02-20_23-59-59.tar.bz2",
                "7-mysite_2024-01-15_08-30-00.tar.bz2",
            ]
        );
    }
}
