//! Backup-run manifest: maps content-addressed local mirror names back to
//! original remote paths and their target types.
//!
//! Written format is always three fields separated by four spaces:
//! `hash    type    originalPath`. A legacy two-field `hash    path` layout
//! (no type) is still accepted on read and implies type "data"; it is never
//! written. Long-term support for the legacy layout is undecided.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const MANIFEST_FILENAME: &str = "manifest.txt";
const FIELD_SEPARATOR: &str = "    ";

/// Small closed tag for what a localized directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// The installation root.
    App,
    /// Auxiliary content directories.
    Data,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::App => "app",
            TargetType::Data => "data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "app" => Some(TargetType::App),
            "data" => Some(TargetType::Data),
            _ => None,
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One manifest record. `hash` is the hash of the original remote path
/// string, not of file contents; it doubles as the local mirror directory
/// name for this backup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub hash: String,
    pub target_type: TargetType,
    pub original_path: String,
}

impl ManifestEntry {
    pub fn new(target_type: TargetType, original_path: impl Into<String>) -> Self {
        let original_path = original_path.into();
        Self {
            hash: path_hash(&original_path),
            target_type,
            original_path,
        }
    }

    /// Basename of the original path, the directory the mirror holds.
    pub fn basename(&self) -> &str {
        self.original_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.original_path)
    }
}

/// Deterministic, collision-resistant mirror name for one remote path.
pub fn path_hash(path: &str) -> String {
    format!("{:x}", md5::compute(path))
}

/// Parse manifest text. Blank lines are skipped; surrounding whitespace per
/// line is insignificant.
pub fn parse(text: &str) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.splitn(3, FIELD_SEPARATOR).collect();
        let entry = match parts.as_slice() {
            [hash, type_field, path] => match TargetType::parse(type_field) {
                Some(target_type) => ManifestEntry {
                    hash: hash.to_string(),
                    target_type,
                    original_path: path.trim().to_string(),
                },
                // Legacy layout whose path happens to contain the separator.
                None => ManifestEntry {
                    hash: hash.to_string(),
                    target_type: TargetType::Data,
                    original_path: format!("{type_field}{FIELD_SEPARATOR}{path}").trim().to_string(),
                },
            },
            [hash, path] => ManifestEntry {
                hash: hash.to_string(),
                target_type: TargetType::Data,
                original_path: path.trim().to_string(),
            },
            _ => {
                tracing::warn!(line, "skipping malformed manifest line");
                continue;
            }
        };
        entries.push(entry);
    }
    entries
}

/// Write entries to `backup_dir/manifest.txt` in the current three-field
/// form, in the given order. Every record's mirror directory must already
/// exist under `backup_dir`; a record without its mirror would make the
/// manifest lie about what the backup holds, so that is a hard error.
pub fn write(entries: &[ManifestEntry], backup_dir: &Path) -> anyhow::Result<()> {
    let mut out = String::new();
    for entry in entries {
        let mirror = backup_dir.join(&entry.hash);
        if !mirror.is_dir() {
            anyhow::bail!(
                "mirror directory {} for {} does not exist",
                mirror.display(),
                entry.original_path
            );
        }
        out.push_str(&format!(
            "{}{sep}{}{sep}{}\n",
            entry.hash,
            entry.target_type,
            entry.original_path,
            sep = FIELD_SEPARATOR
        ));
    }
    std::fs::write(backup_dir.join(MANIFEST_FILENAME), out)?;
    Ok(())
}
