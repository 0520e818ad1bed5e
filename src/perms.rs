//! Local permission normalization for backup artifacts.
//!
//! Mirror trees are written with whatever modes the transport preserved; the
//! policy re-derives sane local modes from a single base mode so the archive
//! carries predictable permissions.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rusqlite::Connection;

use crate::models::instance;

/// Per-instance permission policy, read from the property store. Absent
/// properties fall back to mode 0770 and no ownership change.
#[derive(Debug, Clone)]
pub struct FilePolicy {
    pub mode: u32,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Default for FilePolicy {
    fn default() -> Self {
        Self {
            mode: 0o770,
            user: None,
            group: None,
        }
    }
}

impl FilePolicy {
    pub fn for_instance(conn: &Connection, instance_id: i64) -> anyhow::Result<Self> {
        let mode = match instance::get_prop(conn, instance_id, "backup_perm")? {
            Some(raw) => u32::from_str_radix(raw.trim_start_matches("0o"), 8)
                .map_err(|_| anyhow::anyhow!("invalid backup_perm property '{raw}'"))?,
            None => 0o770,
        };
        Ok(Self {
            mode,
            user: instance::get_prop(conn, instance_id, "backup_user")?,
            group: instance::get_prop(conn, instance_id, "backup_group")?,
        })
    }

    /// Directories additionally get the execute bit wherever the base mode
    /// grants read; files never keep execute bits.
    pub fn mode_for_dir(&self) -> u32 {
        ((self.mode & 0o444) >> 2) | self.mode
    }

    pub fn mode_for_file(&self) -> u32 {
        self.mode & !0o111
    }

    /// Apply the policy to `path` and everything below it. Ownership changes
    /// require root and are skipped otherwise.
    pub fn fix(&self, path: &Path) -> anyhow::Result<()> {
        for entry in walkdir::WalkDir::new(path) {
            let entry = entry?;
            let mode = if entry.file_type().is_dir() {
                self.mode_for_dir()
            } else {
                self.mode_for_file()
            };
            std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))?;
            self.chown(entry.path())?;
        }
        Ok(())
    }

    fn chown(&self, path: &Path) -> anyhow::Result<()> {
        if self.user.is_none() && self.group.is_none() {
            return Ok(());
        }
        if !nix::unistd::geteuid().is_root() {
            tracing::debug!(path = %path.display(), "not root, skipping ownership change");
            return Ok(());
        }

        let uid = match &self.user {
            Some(name) => nix::unistd::User::from_name(name)?
                .map(|u| u.uid)
                .ok_or_else(|| anyhow::anyhow!("unknown user '{name}'"))
                .map(Some)?,
            None => None,
        };
        let gid = match &self.group {
            Some(name) => nix::unistd::Group::from_name(name)?
                .map(|g| g.gid)
                .ok_or_else(|| anyhow::anyhow!("unknown group '{name}'"))
                .map(Some)?,
            None => None,
        };
        nix::unistd::chown(path, uid, gid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_split() {
        let policy = FilePolicy::default();
        assert_eq!(policy.mode_for_dir(), 0o770);
        assert_eq!(policy.mode_for_file(), 0o660);
    }

    #[test]
    fn test_read_bits_become_dir_execute_bits() {
        let policy = FilePolicy {
            mode: 0o644,
            ..Default::default()
        };
        assert_eq!(policy.mode_for_dir(), 0o755);
        assert_eq!(policy.mode_for_file(), 0o644);
    }

    #[test]
    fn test_fix_applies_recursively() {
        let temp = tempfile::TempDir::new().unwrap();
        let sub = temp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = sub.join("f.txt");
        std::fs::write(&file, b"x").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o777)).unwrap();

        FilePolicy::default().fix(temp.path()).unwrap();

        let dir_mode = std::fs::metadata(&sub).unwrap().permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o770);
        assert_eq!(file_mode, 0o660);
    }

    #[test]
    fn test_policy_from_properties() {
        let pool = crate::db::connection::create_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        crate::db::migrate(&conn).unwrap();
        let inst = instance::create(
            &conn,
            &instance::CreateInstance {
                name: "site".into(),
                contact: String::new(),
                webroot: "/var/www".into(),
                weburl: String::new(),
                tempdir: "/tmp".into(),
                interpreter: String::new(),
                transport: "local".into(),
            },
        )
        .unwrap();
        instance::set_prop(&conn, inst.id, "backup_perm", "0750").unwrap();
        instance::set_prop(&conn, inst.id, "backup_group", "staff").unwrap();

        let policy = FilePolicy::for_instance(&conn, inst.id).unwrap();
        assert_eq!(policy.mode, 0o750);
        assert_eq!(policy.group.as_deref(), Some("staff"));
        assert!(policy.user.is_none());
    }
}
