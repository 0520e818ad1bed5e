//! Capability-typed handles bound to an Instance.
//!
//! An [`Access`] wraps one [`HostAdapter`] and exposes only the operations
//! its capability set allows. Invoking an operation outside the declared set
//! is a programming error, not a runtime-recoverable condition: it panics.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::command::Command;
use crate::config::Config;
use crate::error::TransportError;
use crate::host::{self, Endpoint, HostAdapter};
use crate::models::instance::{self, AccessRecord, Instance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Run arbitrary shell commands on the endpoint.
    Scripting,
    /// Push, pull and stat files.
    FileTransfer,
    /// Expose the remote tree at a local path.
    Mountable,
}

impl Capability {
    fn bit(self) -> u8 {
        match self {
            Capability::Scripting => 0b001,
            Capability::FileTransfer => 0b010,
            Capability::Mountable => 0b100,
        }
    }
}

/// Closed set over the three capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.0 |= cap.bit();
        self
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Capability set a transport type declares.
    pub fn for_transport(kind: &str) -> Self {
        match kind {
            "local" => Self::empty()
                .with(Capability::Scripting)
                .with(Capability::FileTransfer)
                .with(Capability::Mountable),
            "ssh" => Self::empty()
                .with(Capability::Scripting)
                .with(Capability::FileTransfer),
            "ftp" => Self::empty().with(Capability::FileTransfer),
            _ => Self::empty(),
        }
    }
}

pub struct Access {
    instance_id: i64,
    caps: CapabilitySet,
    adapter: Box<dyn HostAdapter>,
}

impl std::fmt::Debug for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Access")
            .field("instance_id", &self.instance_id)
            .field("kind", &self.adapter.kind())
            .field("caps", &self.caps)
            .finish()
    }
}

impl Access {
    pub fn new(instance_id: i64, caps: CapabilitySet, adapter: Box<dyn HostAdapter>) -> Self {
        Self {
            instance_id,
            caps,
            adapter,
        }
    }

    /// Resolve (and cache for the instance's lifetime) the Access whose
    /// capability set contains `cap`, preferring the most capable transport
    /// registered for the instance.
    pub fn best_for(
        instance: &Instance,
        cap: Capability,
        conn: &Connection,
        config: &Config,
    ) -> anyhow::Result<Arc<Mutex<Access>>> {
        {
            let cache = instance.access_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(access) = cache.get(&cap) {
                return Ok(access.clone());
            }
        }

        let mut records = instance::access_records(conn, instance.id)?;
        records.retain(|r| CapabilitySet::for_transport(&r.kind).contains(cap));
        records.sort_by_key(|r| std::cmp::Reverse(CapabilitySet::for_transport(&r.kind).len()));

        let record = records.first().ok_or_else(|| {
            anyhow::anyhow!(
                "no access with capability {:?} registered for instance {}",
                cap,
                instance.id
            )
        })?;

        let access = Arc::new(Mutex::new(build(instance.id, record, config)?));
        let mut cache = instance.access_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(cap, access.clone());
        Ok(access)
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.caps
    }

    pub fn kind(&self) -> &'static str {
        self.adapter.kind()
    }

    fn require(&self, cap: Capability) {
        if !self.caps.contains(cap) {
            panic!(
                "access ({}) for instance {} does not grant {:?}",
                self.adapter.kind(),
                self.instance_id,
                cap
            );
        }
    }

    pub fn run(&mut self, cmd: &mut Command) -> Result<(), TransportError> {
        self.require(Capability::Scripting);
        self.adapter.run(cmd)
    }

    /// Run one shell line through `sh -c`, for pipelines that cannot be
    /// expressed as a single argv. Returns the finished command for status
    /// and output inspection.
    pub fn sh(&mut self, line: &str) -> Result<Command, TransportError> {
        let mut cmd = Command::new("sh").arg("-c").arg(line);
        self.run(&mut cmd)?;
        Ok(cmd)
    }

    pub fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.require(Capability::FileTransfer);
        self.adapter.transfer_out(local, remote)
    }

    pub fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.require(Capability::FileTransfer);
        self.adapter.transfer_in(remote, local)
    }

    pub fn file_exists(&mut self, remote: &str) -> Result<bool, TransportError> {
        self.require(Capability::FileTransfer);
        self.adapter.exists(remote)
    }

    pub fn file_contents(&mut self, remote: &str) -> Result<String, TransportError> {
        self.require(Capability::FileTransfer);
        self.adapter.read_file(remote)
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.adapter.set_env(key, value);
    }

    pub fn chdir(&mut self, dir: &str) {
        self.adapter.set_working_dir(dir);
    }

    /// Local path at which the remote tree is reachable.
    pub fn mounted_path(&self, remote: &str) -> PathBuf {
        self.require(Capability::Mountable);
        self.adapter
            .mount_point(remote)
            .expect("mountable adapter returned no mount point")
    }

    /// Recursively mirror a remote directory under `local`. A non-zero error
    /// code reports partial or total failure without aborting sibling
    /// localizations; the caller decides whether to continue.
    pub fn localize_directory(
        &mut self,
        remote: &str,
        local: &Path,
    ) -> Result<i32, TransportError> {
        self.require(Capability::FileTransfer);
        self.adapter.localize_dir(remote, local)
    }

    /// Upload a script if necessary and run it with the instance's configured
    /// interpreter, returning captured stdout.
    pub fn run_interpreter_script(
        &mut self,
        interpreter: &str,
        script: &Path,
        remote_work_dir: &str,
        args: &[String],
    ) -> Result<String, TransportError> {
        self.require(Capability::Scripting);

        let script_path = if self.adapter.kind() == "local" {
            script.to_string_lossy().into_owned()
        } else {
            let name = script
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "script".into());
            let remote = format!("{}/{}", remote_work_dir.trim_end_matches('/'), name);
            self.adapter.transfer_out(script, &remote)?;
            remote
        };

        let mut cmd = Command::new(interpreter).arg(script_path).args(args.to_vec());
        self.adapter.run(&mut cmd)?;
        Ok(cmd.stdout().to_string())
    }
}

fn build(instance_id: i64, record: &AccessRecord, config: &Config) -> anyhow::Result<Access> {
    let caps = CapabilitySet::for_transport(&record.kind);
    let adapter: Box<dyn HostAdapter> = match record.kind.as_str() {
        "local" => Box::new(host::local::LocalHost::new()),
        "ssh" => host::connect_ssh(
            Endpoint::new(record.host.clone(), record.user.clone(), record.port),
            config.ssh_keys(),
        ),
        "ftp" => Box::new(host::ftp::FtpHost::connect(
            Endpoint::new(record.host.clone(), record.user.clone(), record.port),
            record.password.as_deref(),
        )?),
        other => anyhow::bail!("unknown transport type '{other}'"),
    };
    Ok(Access::new(instance_id, caps, adapter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::local::LocalHost;

    fn transfer_only_access() -> Access {
        Access::new(
            1,
            CapabilitySet::empty().with(Capability::FileTransfer),
            Box::new(LocalHost::new()),
        )
    }

    #[test]
    fn test_capability_sets_per_transport() {
        let local = CapabilitySet::for_transport("local");
        assert!(local.contains(Capability::Scripting));
        assert!(local.contains(Capability::FileTransfer));
        assert!(local.contains(Capability::Mountable));

        let ssh = CapabilitySet::for_transport("ssh");
        assert!(ssh.contains(Capability::Scripting));
        assert!(!ssh.contains(Capability::Mountable));

        let ftp = CapabilitySet::for_transport("ftp");
        assert_eq!(ftp.len(), 1);
        assert!(ftp.contains(Capability::FileTransfer));
    }

    #[test]
    #[should_panic(expected = "does not grant Scripting")]
    fn test_scripting_on_transfer_only_access_fails_fast() {
        let mut access = transfer_only_access();
        let mut cmd = Command::new("true");
        let _ = access.run(&mut cmd);
    }

    #[test]
    fn test_granted_operations_pass_through() {
        let mut access = Access::new(
            1,
            CapabilitySet::for_transport("local"),
            Box::new(LocalHost::new()),
        );
        let cmd = access.sh("echo ok").unwrap();
        assert!(cmd.succeeded());
        assert_eq!(cmd.stdout().trim(), "ok");
    }

    #[test]
    fn test_transfer_only_access_can_stat() {
        let mut access = transfer_only_access();
        assert!(access.file_exists("/").unwrap());
    }

    #[test]
    fn test_run_interpreter_script_captures_stdout() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("greet.sh");
        std::fs::write(&script, "echo \"hello $1\"\n").unwrap();

        let mut access = Access::new(
            1,
            CapabilitySet::for_transport("local"),
            Box::new(LocalHost::new()),
        );
        let out = access
            .run_interpreter_script("sh", &script, "/tmp", &["fleet".to_string()])
            .unwrap();
        assert_eq!(out.trim(), "hello fleet");
    }

    #[test]
    fn test_mounted_path_exposes_remote_tree() {
        let access = Access::new(
            1,
            CapabilitySet::for_transport("local"),
            Box::new(LocalHost::new()),
        );
        assert_eq!(
            access.mounted_path("/var/www/site"),
            std::path::PathBuf::from("/var/www/site")
        );
    }

    #[test]
    #[should_panic(expected = "does not grant Mountable")]
    fn test_mounted_path_without_capability_fails_fast() {
        let access = transfer_only_access();
        let _ = access.mounted_path("/var/www/site");
    }
}
