use std::path::PathBuf;

use crate::host::SshKeys;

/// Engine configuration. Always passed explicitly into the engines so that
/// multiple engines with different roots can coexist in one process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local root under which per-instance backup mirrors are built.
    pub backup_root: PathBuf,
    /// Local root under which finished archives are stored.
    pub archive_root: PathBuf,
    /// Local scratch directory (manifest-only extractions land here).
    pub temp_dir: PathBuf,
    pub db_path: PathBuf,
    pub ssh_key_path: PathBuf,
    pub ssh_public_key_path: PathBuf,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "data".into()),
        );
        let home_ssh = dirs_ssh_key();

        Self {
            backup_root: std::env::var("BACKUP_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("backup")),
            archive_root: std::env::var("ARCHIVE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("archive")),
            temp_dir: std::env::var("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("tmp")),
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("instance-manager.db")),
            ssh_key_path: std::env::var("SSH_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| home_ssh.clone()),
            ssh_public_key_path: std::env::var("SSH_PUBLIC_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let mut p = home_ssh.into_os_string();
                    p.push(".pub");
                    PathBuf::from(p)
                }),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }

    /// Minimal configuration rooted under one directory, used by tests and
    /// embedders that manage their own layout.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            backup_root: data_dir.join("backup"),
            archive_root: data_dir.join("archive"),
            temp_dir: data_dir.join("tmp"),
            db_path: data_dir.join("instance-manager.db"),
            ssh_key_path: dirs_ssh_key(),
            ssh_public_key_path: {
                let mut p = dirs_ssh_key().into_os_string();
                p.push(".pub");
                PathBuf::from(p)
            },
            log_level: "info".into(),
        }
    }

    pub fn ssh_keys(&self) -> SshKeys {
        SshKeys {
            private_key: self.ssh_key_path.clone(),
            public_key: self.ssh_public_key_path.clone(),
        }
    }
}

fn dirs_ssh_key() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".ssh").join("id_rsa")
}
