//! FTP adapter. File transfer only; there is no shell on the far side, so
//! command execution reports an unsupported operation.

use std::fs::File;
use std::path::Path;

use suppaftp::types::FileType;
use suppaftp::FtpStream;

use crate::command::Command;
use crate::error::TransportError;
use crate::host::{Endpoint, HostAdapter};

pub struct FtpHost {
    endpoint: Endpoint,
    stream: FtpStream,
}

impl std::fmt::Debug for FtpHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpHost")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl FtpHost {
    pub fn connect(
        endpoint: Endpoint,
        password: Option<&str>,
    ) -> Result<Self, TransportError> {
        let mut stream = FtpStream::connect((endpoint.host.as_str(), endpoint.port))
            .map_err(|e| protocol(&endpoint, e))?;
        stream
            .login(endpoint.user.as_str(), password.unwrap_or(""))
            .map_err(|e| TransportError::Auth {
                endpoint: endpoint.cache_key(),
                reason: e.to_string(),
            })?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| protocol(&endpoint, e))?;

        tracing::info!(endpoint = %endpoint, "established FTP session");
        Ok(Self { endpoint, stream })
    }

    fn err(&self, e: suppaftp::FtpError) -> TransportError {
        protocol(&self.endpoint, e)
    }

    fn is_dir(&mut self, remote: &str) -> bool {
        self.stream.cwd(remote).is_ok()
    }

    /// Download one file, counting a failure instead of aborting the mirror.
    fn retrieve_into(&mut self, remote: &str, local: &Path) -> bool {
        let result = self
            .stream
            .retr_as_buffer(remote)
            .map(|buf| std::fs::write(local, buf.into_inner()));
        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::info!(path = remote, error = %e, "write failed");
                false
            }
            Err(e) => {
                tracing::info!(path = remote, error = %e, "retrieve failed");
                false
            }
        }
    }

    fn mirror(&mut self, remote: &str, local: &Path, failures: &mut usize) {
        if std::fs::create_dir_all(local).is_err() {
            *failures += 1;
            return;
        }
        let entries = match self.stream.nlst(Some(remote)) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::info!(path = remote, error = %e, "listing failed");
                *failures += 1;
                return;
            }
        };
        for entry in entries {
            let name = entry.rsplit('/').next().unwrap_or(&entry);
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            let remote_child = format!("{}/{}", remote.trim_end_matches('/'), name);
            let local_child = local.join(name);
            if self.is_dir(&remote_child) {
                self.mirror(&remote_child, &local_child, failures);
            } else if !self.retrieve_into(&remote_child, &local_child) {
                *failures += 1;
            }
        }
    }
}

fn protocol(endpoint: &Endpoint, e: suppaftp::FtpError) -> TransportError {
    TransportError::Protocol {
        endpoint: endpoint.cache_key(),
        reason: e.to_string(),
    }
}

impl HostAdapter for FtpHost {
    fn kind(&self) -> &'static str {
        "ftp"
    }

    fn run(&mut self, _cmd: &mut Command) -> Result<(), TransportError> {
        Err(TransportError::Unsupported {
            transport: "ftp",
            operation: "command execution",
        })
    }

    fn transfer_out(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let mut file = File::open(local)?;
        self.stream
            .put_file(remote, &mut file)
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    fn transfer_in(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let buf = self.stream.retr_as_buffer(remote).map_err(|e| self.err(e))?;
        std::fs::write(local, buf.into_inner())?;
        Ok(())
    }

    fn exists(&mut self, remote: &str) -> Result<bool, TransportError> {
        Ok(self.stream.size(remote).is_ok() || self.is_dir(remote))
    }

    fn read_file(&mut self, remote: &str) -> Result<String, TransportError> {
        let buf = self.stream.retr_as_buffer(remote).map_err(|e| self.err(e))?;
        Ok(String::from_utf8_lossy(&buf.into_inner()).into_owned())
    }

    fn set_env(&mut self, key: &str, _value: &str) {
        tracing::debug!(key, "FTP transport has no environment, ignoring");
    }

    fn set_working_dir(&mut self, dir: &str) {
        if let Err(e) = self.stream.cwd(dir) {
            tracing::warn!(dir, error = %e, "FTP cwd failed");
        }
    }

    fn localize_dir(&mut self, remote: &str, local: &Path) -> Result<i32, TransportError> {
        let trimmed = remote.trim_end_matches('/');
        let Some(basename) = trimmed.rsplit('/').next().filter(|s| !s.is_empty()) else {
            return Ok(23);
        };
        let mut failures = 0;
        self.mirror(trimmed, &local.join(basename), &mut failures);
        Ok(if failures == 0 { 0 } else { 23 })
    }
}
