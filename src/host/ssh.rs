//! Persistent SSH adapter backed by ssh2.
//!
//! One authenticated session is kept per `(user, host, port)` key and cached
//! process-wide, so every command issued against that endpoint reuses the
//! same connection instead of paying the handshake again. The cache itself is
//! safe for concurrent lookup; each cached session serializes its own command
//! execution behind a mutex.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use ssh2::Session;

use crate::command::Command;
use crate::error::TransportError;
use crate::host::{rsync_pull, Endpoint, HostAdapter, SessionEnv, SshKeys};

static SESSIONS: OnceLock<DashMap<String, Arc<Mutex<Session>>>> = OnceLock::new();

fn sessions() -> &'static DashMap<String, Arc<Mutex<Session>>> {
    SESSIONS.get_or_init(DashMap::new)
}

pub struct SshHost {
    endpoint: Endpoint,
    keys: SshKeys,
    session: Arc<Mutex<Session>>,
    env: SessionEnv,
}

impl std::fmt::Debug for SshHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshHost")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl SshHost {
    /// Resolve or establish the cached session for `endpoint`.
    pub fn connect(endpoint: Endpoint, keys: SshKeys) -> Result<Self, TransportError> {
        let key = endpoint.cache_key();
        if let Some(session) = sessions().get(&key) {
            return Ok(Self {
                endpoint,
                keys,
                session: session.clone(),
                env: SessionEnv::default(),
            });
        }

        let session = Arc::new(Mutex::new(establish(&endpoint, &keys)?));
        sessions().insert(key, session.clone());
        tracing::info!(endpoint = %endpoint, "established SSH session");

        Ok(Self {
            endpoint,
            keys,
            session,
            env: SessionEnv::default(),
        })
    }

    fn exec(
        &self,
        line: &str,
        stdin: Option<&[u8]>,
    ) -> Result<(i32, String, String), TransportError> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let mut channel = session
            .channel_session()
            .map_err(|e| self.protocol_error(e))?;
        channel.exec(line).map_err(|e| self.protocol_error(e))?;

        if let Some(payload) = stdin {
            std::io::Write::write_all(&mut channel, payload)?;
            channel.send_eof().map_err(|e| self.protocol_error(e))?;
        }

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close().map_err(|e| self.protocol_error(e))?;
        let status = channel.exit_status().map_err(|e| self.protocol_error(e))?;
        Ok((status, stdout, stderr))
    }

    fn protocol_error(&self, e: ssh2::Error) -> TransportError {
        TransportError::Protocol {
            endpoint: self.endpoint.cache_key(),
            reason: e.to_string(),
        }
    }
}

fn establish(endpoint: &Endpoint, keys: &SshKeys) -> Result<Session, TransportError> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).map_err(|source| {
        TransportError::Connect {
            endpoint: endpoint.cache_key(),
            source,
        }
    })?;

    let mut session = Session::new().map_err(|e| TransportError::Protocol {
        endpoint: endpoint.cache_key(),
        reason: e.to_string(),
    })?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| TransportError::Protocol {
        endpoint: endpoint.cache_key(),
        reason: e.to_string(),
    })?;

    session
        .userauth_pubkey_file(
            &endpoint.user,
            Some(&keys.public_key),
            &keys.private_key,
            None,
        )
        .map_err(|e| TransportError::Auth {
            endpoint: endpoint.cache_key(),
            reason: e.to_string(),
        })?;

    if !session.authenticated() {
        return Err(TransportError::Auth {
            endpoint: endpoint.cache_key(),
            reason: "public key rejected".into(),
        });
    }

    Ok(session)
}

impl HostAdapter for SshHost {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    fn run(&mut self, cmd: &mut Command) -> Result<(), TransportError> {
        let line = self.env.render(&cmd.full_command());
        tracing::debug!(endpoint = %self.endpoint, command = %line, "running remote command");
        let (status, stdout, stderr) = self.exec(&line, cmd.stdin_payload())?;
        cmd.record(status, stdout, stderr);
        Ok(())
    }

    fn transfer_out(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let data = std::fs::read(local)?;
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let sftp = session.sftp().map_err(|e| self.protocol_error(e))?;
        let mut file = sftp
            .create(Path::new(remote))
            .map_err(|e| self.protocol_error(e))?;
        std::io::Write::write_all(&mut file, &data)?;
        Ok(())
    }

    fn transfer_in(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let contents = {
            let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            let sftp = session.sftp().map_err(|e| self.protocol_error(e))?;
            let mut file = sftp
                .open(Path::new(remote))
                .map_err(|e| self.protocol_error(e))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            buf
        };
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, contents)?;
        Ok(())
    }

    fn exists(&mut self, remote: &str) -> Result<bool, TransportError> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let sftp = session.sftp().map_err(|e| self.protocol_error(e))?;
        Ok(sftp.stat(Path::new(remote)).is_ok())
    }

    fn read_file(&mut self, remote: &str) -> Result<String, TransportError> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let sftp = session.sftp().map_err(|e| self.protocol_error(e))?;
        let mut file = sftp
            .open(Path::new(remote))
            .map_err(|e| self.protocol_error(e))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
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

/// One-shot key installation on a new endpoint. Idempotent: if the key is
/// already trusted (checked by attempting a connection) nothing is done.
pub fn install_public_key(endpoint: &Endpoint, keys: &SshKeys) -> Result<(), TransportError> {
    if establish(endpoint, keys).is_ok() {
        tracing::info!(endpoint = %endpoint, "public key already trusted");
        return Ok(());
    }

    let status = std::process::Command::new("ssh-copy-id")
        .arg("-i")
        .arg(&keys.public_key)
        .arg("-p")
        .arg(endpoint.port.to_string())
        .arg(endpoint.target())
        .status()?;

    if !status.success() {
        return Err(TransportError::Auth {
            endpoint: endpoint.cache_key(),
            reason: format!("ssh-copy-id exited with {}", status.code().unwrap_or(-1)),
        });
    }

    // The connection must work now; surface the failure if it still does not.
    establish(endpoint, keys).map(|_| ())
}
