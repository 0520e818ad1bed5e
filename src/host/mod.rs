//! Transport-specific executors backing an [`Access`](crate::Access).
//!
//! Every adapter satisfies the same contract: execute a [`Command`] against
//! one endpoint and hand it back populated with exit status and both output
//! streams, or fail with a [`TransportError`] before any status is recorded.

pub mod ftp;
pub mod local;
pub mod ssh;
pub mod ssh_exec;

use std::path::{Path, PathBuf};

use crate::command::{sh_quote, Command};
use crate::error::TransportError;

/// Identity of one remote endpoint; also the process-wide connection cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, user: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port,
        }
    }

    pub fn cache_key(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cache_key())
    }
}

/// Key pair used for SSH public-key authentication.
#[derive(Debug, Clone)]
pub struct SshKeys {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

/// Session-scoped environment emulation shared by the shell transports.
/// Variables are serialized as `export K=V;` prefixes in declaration order,
/// the working directory as a `cd <dir>;` prefix, prepended to every line.
#[derive(Debug, Clone, Default)]
pub struct SessionEnv {
    vars: Vec<(String, String)>,
    cwd: Option<String>,
}

impl SessionEnv {
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.vars.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_string();
        } else {
            self.vars.push((key.to_string(), value.to_string()));
        }
    }

    pub fn chdir(&mut self, dir: &str) {
        self.cwd = if dir.is_empty() {
            None
        } else {
            Some(dir.to_string())
        };
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Render `line` with the export and cd prefixes applied.
    pub fn render(&self, line: &str) -> String {
        let mut full = String::new();
        for (key, value) in &self.vars {
            full.push_str(&format!("export {}={}; ", key, sh_quote(value)));
        }
        if let Some(cwd) = &self.cwd {
            full.push_str(&format!("cd {}; ", sh_quote(cwd)));
        }
        full.push_str(line);
        full
    }
}

/// Transport-specific executor of Commands and file transfers against one
/// endpoint. A non-zero exit status is reported through the command, never
/// as an adapter error.
pub trait HostAdapter: Send {
    /// Short transport tag ("local", "ssh", "ssh-exec", "ftp").
    fn kind(&self) -> &'static str;

    fn run(&mut self, cmd: &mut Command) -> Result<(), TransportError>;

    fn transfer_out(&mut self, local: &Path, remote: &str) -> Result<(), TransportError>;

    fn transfer_in(&mut self, remote: &str, local: &Path) -> Result<(), TransportError>;

    fn exists(&mut self, remote: &str) -> Result<bool, TransportError>;

    fn read_file(&mut self, remote: &str) -> Result<String, TransportError>;

    fn set_env(&mut self, key: &str, value: &str);

    fn set_working_dir(&mut self, dir: &str);

    /// Recursively mirror a remote directory tree below `local`, creating
    /// `local/<basename>` the way `rsync <remote> <local>/` would. Returns an
    /// rsync-style exit code: zero on success, non-zero on partial or total
    /// failure. Transport failures still raise [`TransportError`].
    fn localize_dir(&mut self, remote: &str, local: &Path) -> Result<i32, TransportError>;

    /// Local path at which the remote tree is directly reachable, for
    /// transports that can mount it. `None` everywhere else.
    fn mount_point(&self, _remote: &str) -> Option<PathBuf> {
        None
    }
}

/// Build an SSH adapter for `endpoint`. The persistent ssh2 implementation is
/// attempted first; if it cannot be constructed the process-spawning fallback
/// takes over. The construction failure is logged, never propagated.
pub fn connect_ssh(endpoint: Endpoint, keys: SshKeys) -> Box<dyn HostAdapter> {
    match ssh::SshHost::connect(endpoint.clone(), keys.clone()) {
        Ok(adapter) => Box::new(adapter),
        Err(e) => {
            tracing::warn!(
                endpoint = %endpoint,
                error = %e,
                "persistent SSH session unavailable, falling back to ssh client"
            );
            Box::new(ssh_exec::SshExecHost::new(endpoint, keys))
        }
    }
}

/// Pull a remote directory to a local mirror over rsync-over-ssh. Used by
/// both SSH adapters; runs on the manager side.
pub(crate) fn rsync_pull(
    endpoint: &Endpoint,
    keys: &SshKeys,
    remote: &str,
    local: &Path,
) -> Result<i32, TransportError> {
    std::fs::create_dir_all(local)?;

    let rsh = format!(
        "ssh -i {} -p {} -o BatchMode=yes -o StrictHostKeyChecking=accept-new",
        sh_quote(&keys.private_key.to_string_lossy()),
        endpoint.port
    );
    let source = format!("{}:{}", endpoint.target(), remote.trim_end_matches('/'));

    let output = std::process::Command::new("rsync")
        .arg("-aL")
        .arg("--delete")
        .arg("-e")
        .arg(rsh)
        .arg(&source)
        .arg(local)
        .output()?;

    let code = output.status.code().unwrap_or(-1);
    if code != 0 {
        tracing::info!(source = %source, code, "rsync exited non-zero");
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_renders_in_declaration_order() {
        let mut env = SessionEnv::default();
        env.set("PATH", "/opt/bin:/usr/bin");
        env.set("LANG", "C");
        env.set("PATH", "/usr/bin");

        assert_eq!(
            env.render("php -v"),
            "export PATH=/usr/bin; export LANG=C; php -v"
        );
    }

    #[test]
    fn test_cwd_is_emulated_as_cd_prefix() {
        let mut env = SessionEnv::default();
        env.chdir("/var/www/html");
        assert_eq!(env.render("ls"), "cd /var/www/html; ls");

        env.chdir("");
        assert_eq!(env.render("ls"), "ls");
    }

    #[test]
    fn test_endpoint_cache_key() {
        let ep = Endpoint::new("db01.example.org", "deploy", 2222);
        assert_eq!(ep.cache_key(), "deploy@db01.example.org:2222");
    }

    #[test]
    fn test_ssh_selection_falls_back_without_propagating() {
        // .invalid never resolves, so the persistent session cannot be
        // constructed; selection must still yield a working adapter kind.
        let keys = SshKeys {
            private_key: "/nonexistent/id_rsa".into(),
            public_key: "/nonexistent/id_rsa.pub".into(),
        };
        let adapter = connect_ssh(Endpoint::new("host.invalid", "nobody", 2222), keys);
        assert_eq!(adapter.kind(), "ssh-exec");
    }
}
