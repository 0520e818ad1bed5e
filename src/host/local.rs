//! Adapter for instances living on the manager host itself.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use walkdir::WalkDir;

use crate::command::Command;
use crate::error::TransportError;
use crate::host::{HostAdapter, SessionEnv};

/// Executes commands as child processes and moves files with plain
/// filesystem calls. Environment and working directory are applied natively
/// instead of being emulated as shell prefixes.
#[derive(Debug, Default)]
pub struct LocalHost {
    env: SessionEnv,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostAdapter for LocalHost {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn run(&mut self, cmd: &mut Command) -> Result<(), TransportError> {
        let mut proc = std::process::Command::new(cmd.program());
        proc.args(cmd.arg_list());
        for (key, value) in self.env.vars() {
            proc.env(key, value);
        }
        if let Some(cwd) = self.env.cwd() {
            proc.current_dir(cwd);
        }
        proc.stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!(command = %cmd.full_command(), "running local command");

        if cmd.stdin_payload().is_some() {
            proc.stdin(Stdio::piped());
            let mut child = proc.spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(cmd.stdin_payload().unwrap_or_default())?;
            }
            let output = child.wait_with_output()?;
            cmd.record(
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            );
        } else {
            let output = proc.output()?;
            cmd.record(
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            );
        }
        Ok(())
    }

    fn transfer_out(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        if let Some(parent) = Path::new(remote).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(local, remote)?;
        Ok(())
    }

    fn transfer_in(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(remote, local)?;
        Ok(())
    }

    fn exists(&mut self, remote: &str) -> Result<bool, TransportError> {
        Ok(Path::new(remote).exists())
    }

    fn read_file(&mut self, remote: &str) -> Result<String, TransportError> {
        Ok(std::fs::read_to_string(remote)?)
    }

    fn set_env(&mut self, key: &str, value: &str) {
        self.env.set(key, value);
    }

    fn set_working_dir(&mut self, dir: &str) {
        self.env.chdir(dir);
    }

    fn localize_dir(&mut self, remote: &str, local: &Path) -> Result<i32, TransportError> {
        let src = PathBuf::from(remote.trim_end_matches('/'));
        let Some(basename) = src.file_name() else {
            return Ok(23);
        };
        std::fs::create_dir_all(local)?;
        Ok(mirror_tree(&src, &local.join(basename)))
    }

    fn mount_point(&self, remote: &str) -> Option<PathBuf> {
        Some(PathBuf::from(remote))
    }
}

/// Mirror `src` into `dst`: copy everything, then drop destination entries
/// that no longer exist in the source. Returns 0 on success, 23 on partial
/// failure (the rsync convention the other transports report).
fn mirror_tree(src: &Path, dst: &Path) -> i32 {
    let mut failed = false;

    if !src.is_dir() {
        return 23;
    }

    for entry in WalkDir::new(src).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::info!(error = %e, "skipping unreadable entry");
                failed = true;
                continue;
            }
        };
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        let result = if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
        } else {
            std::fs::copy(entry.path(), &target).map(|_| ())
        };
        if let Err(e) = result {
            tracing::info!(path = %entry.path().display(), error = %e, "copy failed");
            failed = true;
        }
    }

    // Delete pass, deepest entries first so directories empty out.
    for entry in WalkDir::new(dst).contents_first(true) {
        let Ok(entry) = entry else { continue };
        let rel = entry.path().strip_prefix(dst).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() || src.join(rel).exists() {
            continue;
        }
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir_all(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        if let Err(e) = result {
            tracing::info!(path = %entry.path().display(), error = %e, "delete failed");
            failed = true;
        }
    }

    if failed {
        23
    } else {
        0
    }
}
