//! Checksum baselines and drift detection.
//!
//! The baseline is the file map stored with an instance's latest version:
//! relative path to content hash for everything under the web root. Checking
//! re-enumerates the live tree on the endpoint and reports what appeared,
//! changed or disappeared since the baseline was taken.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;

use crate::access::{Access, Capability};
use crate::config::Config;
use crate::models::instance::Instance;
use crate::models::version::{self, NewVersion};

/// Hashes every regular file under the current directory, one
/// `hash:relative/path` line per file. Runs entirely on the endpoint so only
/// the digest list crosses the wire.
const HASH_PIPELINE: &str =
    r"find . -type f -print0 | xargs -0 md5sum | sed 's|^\([0-9a-f]*\)  \./|\1:|'";

/// Differences between a stored baseline and the live tree.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Present on the endpoint but absent from the baseline.
    pub new: BTreeMap<String, String>,
    /// Present in both with differing hashes; values are current hashes.
    pub modified: BTreeMap<String, String>,
    /// In the baseline but gone from the endpoint.
    pub deleted: Vec<String>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.new.len() + self.modified.len() + self.deleted.len()
    }
}

pub struct ChecksumEngine {
    config: Config,
}

impl ChecksumEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Enumerate the live tree and store it as the baseline of the
    /// instance's latest version, creating a version if none exists yet.
    /// Returns the number of files recorded.
    pub fn collect(&self, conn: &mut Connection, instance: &Instance) -> anyhow::Result<usize> {
        let current = self.enumerate(conn, instance)?;

        let version = match version::latest_for_instance(conn, instance.id)? {
            Some(v) => v,
            None => version::create(conn, instance.id, &NewVersion::default())?,
        };
        version::replace_file_map(conn, version.id, &current)?;

        tracing::info!(
            instance = instance.id,
            version = version.id,
            files = current.len(),
            "checksum baseline collected"
        );
        Ok(current.len())
    }

    /// Compare the live tree against the stored baseline.
    pub fn check(&self, conn: &Connection, instance: &Instance) -> anyhow::Result<DriftReport> {
        let version = version::latest_for_instance(conn, instance.id)?
            .ok_or_else(|| anyhow::anyhow!("instance {} has no recorded version", instance.id))?;
        let stored = version::file_map(conn, version.id)?;
        let current = self.enumerate(conn, instance)?;
        Ok(diff(&stored, &current))
    }

    /// Carry the baseline of `from_version` over to `to_version` unchanged.
    pub fn replicate(
        &self,
        conn: &Connection,
        to_version: i64,
        from_version: i64,
    ) -> anyhow::Result<()> {
        version::replicate_file_map(conn, to_version, from_version)
    }

    fn enumerate(
        &self,
        conn: &Connection,
        instance: &Instance,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        let access = Access::best_for(instance, Capability::Scripting, conn, &self.config)?;
        enumerate_via(&access, &instance.webroot)
    }
}

/// Run the hash pipeline under `webroot` through an already-resolved access
/// handle. Shared with the restore engine's baseline collection.
pub(crate) fn enumerate_via(
    access: &std::sync::Arc<std::sync::Mutex<Access>>,
    webroot: &str,
) -> anyhow::Result<BTreeMap<String, String>> {
    let mut access = access.lock().unwrap_or_else(|e| e.into_inner());
    access.chdir(webroot);
    let cmd = access.sh(HASH_PIPELINE)?;
    if !cmd.succeeded() {
        anyhow::bail!(
            "hash enumeration under {} exited with {}: {}",
            webroot,
            cmd.status().unwrap_or(-1),
            cmd.stderr().trim()
        );
    }
    Ok(parse_hash_stream(cmd.stdout()))
}

/// Parse `hash:path` lines. Malformed lines are logged and dropped so one
/// unreadable file does not sink the whole enumeration.
pub fn parse_hash_stream(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((hash, path))
                if hash.len() == 32
                    && hash.bytes().all(|b| b.is_ascii_hexdigit())
                    && !path.is_empty() =>
            {
                map.insert(path.to_string(), hash.to_string());
            }
            _ => tracing::warn!(line, "skipping malformed hash line"),
        }
    }
    map
}

/// Three-way difference between two file maps.
pub fn diff(stored: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> DriftReport {
    let mut report = DriftReport::default();
    for (path, hash) in current {
        match stored.get(path) {
            None => {
                report.new.insert(path.clone(), hash.clone());
            }
            Some(old) if old != hash => {
                report.modified.insert(path.clone(), hash.clone());
            }
            Some(_) => {}
        }
    }
    for path in stored.keys() {
        if !current.contains_key(path) {
            report.deleted.push(path.clone());
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_hash_stream() {
        let text = "d41d8cd98f00b204e9800998ecf8427e:index.html\n\
                    900150983cd24fb0d6963f7d28e17f72:img/logo.png\n\
                    garbage line\n\
                    :missing-hash\n";
        let parsed = parse_hash_stream(text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed.get("index.html").map(String::as_str),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
    }

    #[test]
    fn test_diff_reports_three_ways() {
        let stored = map(&[("kept.txt", "h1"), ("changed.txt", "h2"), ("gone.txt", "h3")]);
        let current = map(&[("kept.txt", "h1"), ("changed.txt", "h9"), ("fresh.txt", "h4")]);

        let report = diff(&stored, &current);
        assert_eq!(report.new, map(&[("fresh.txt", "h4")]));
        assert_eq!(report.modified, map(&[("changed.txt", "h9")]));
        assert_eq!(report.deleted, vec!["gone.txt".to_string()]);
        assert_eq!(report.change_count(), 3);
    }

    #[test]
    fn test_diff_of_identical_maps_is_clean() {
        let stored = map(&[("a", "h1"), ("b", "h2")]);
        let report = diff(&stored, &stored.clone());
        assert!(report.is_clean());
        assert_eq!(report.change_count(), 0);
    }
}
