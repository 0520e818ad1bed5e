//! Process-spawning SSH fallback.
//!
//! Shells out to the system `ssh`/`scp` clients once per invocation. Used
//! when the persistent ssh2 session cannot be constructed (unsupported
//! platform or key format); applies the same environment-variable and
//! working-directory emulation as the persistent adapter.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use crate::command::{sh_quote, Command};
use crate::error::TransportError;
use crate::host::{rsync_pull, Endpoint, HostAdapter, SessionEnv, SshKeys};

/// `ssh` reserves status 255 for its own connection and protocol failures;
/// anything else is the remote command's exit status.
const SSH_CLIENT_FAILURE: i32 = 255;

#[derive(Debug)]
pub struct SshExecHost {
    endpoint: Endpoint,
    keys: SshKeys,
    env: SessionEnv,
}

impl SshExecHost {
    pub fn new(endpoint: Endpoint, keys: SshKeys) -> Self {
        Self {
            endpoint,
            keys,
            env: SessionEnv::default(),
        }
    }

    fn client(&self, program: &str) -> std::process::Command {
        let mut proc = std::process::Command::new(program);
        proc.arg("-i")
            .arg(&self.keys.private_key)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");
        proc
    }

    fn exec(
        &self,
        line: &str,
        stdin: Option<&[u8]>,
    ) -> Result<(i32, String, String), TransportError> {
        let mut proc = self.client("ssh");
        proc.arg("-p")
            .arg(self.endpoint.port.to_string())
            .arg(self.endpoint.target())
            .arg(line)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = if let Some(payload) = stdin {
            proc.stdin(Stdio::piped());
            let mut child = proc.spawn()?;
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(payload)?;
            }
            child.wait_with_output()?
        } else {
            proc.stdin(Stdio::null());
            proc.output()?
        };

        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if status == SSH_CLIENT_FAILURE {
            return Err(TransportError::Protocol {
                endpoint: self.endpoint.cache_key(),
                reason: stderr.trim().to_string(),
            });
        }
        Ok((status, stdout, stderr))
    }

    fn scp(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let output = self
            .client("scp")
            .arg("-P")
            .arg(self.endpoint.port.to_string())
            .arg(from)
            .arg(to)
            .output()?;

        if !output.status.success() {
            return Err(TransportError::Protocol {
                endpoint: self.endpoint.cache_key(),
                reason: format!(
                    "scp exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl HostAdapter for SshExecHost {
    fn kind(&self) -> &'static str {
        "ssh-exec"
    }

    fn run(&mut self, cmd: &mut Command) -> Result<(), TransportError> {
        let line = self.env.render(&cmd.full_command());
        tracing::debug!(endpoint = %self.endpoint, command = %line, "running remote command via ssh client");
        let (status, stdout, stderr) = self.exec(&line, cmd.stdin_payload())?;
        cmd.record(status, stdout, stderr);
        Ok(())
    }

    fn transfer_out(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.scp(
            &local.to_string_lossy(),
            &format!("{}:{}", self.endpoint.target(), remote),
        )
    }

    fn transfer_in(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.scp(
            &format!("{}:{}", self.endpoint.target(), remote),
            &local.to_string_lossy(),
        )
    }

    fn exists(&mut self, remote: &str) -> Result<bool, TransportError> {
        let line = format!("test -e {}", sh_quote(remote));
        let (status, _, _) = self.exec(&line, None)?;
        Ok(status == 0)
    }

    fn read_file(&mut self, remote: &str) -> Result<String, TransportError> {
        let line = format!("cat {}", sh_quote(remote));
        let (status, stdout, stderr) = self.exec(&line, None)?;
        if status != 0 {
            return Err(TransportError::Protocol {
                endpoint: self.endpoint.cache_key(),
                reason: format!("cat {} exited with {}: {}", remote, status, stderr.trim()),
            });
        }
        Ok(stdout)
    }

    fn set_env(&mut self, key: &str, value: &str) {
        self.env.set(key, value);
    }

    fn set_working_dir(&mut self, dir: &str) {
        self.env.chdir(dir);
    }

    fn localize_dir(&mut self, remote: &str, local: &Path) -> Result<i32, TransportError> {
        rsync_pull(&self.endpoint, &self.keys, remote, local)
    }
}
