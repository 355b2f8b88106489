//! Synchronous SSH/SFTP deployer backed by `ssh2` (libssh2 bindings).
//!
//! `ssh2` was picked over the one async SSH crate seen in the retrieved
//! pack (`russh`, used by `examples/other_examples/manifests/styliteag-ssm`)
//! because everything else in this codebase — the Store, the parallel
//! runner — is synchronous and thread-pool based, following the teacher;
//! pulling in an async runtime for this one component alone would split
//! the codebase across two concurrency models for no benefit.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use failure::ResultExt;
use ssh2::Session;

use crate::deploy::{Connector, Deployer};
use crate::error::ErrorKind;
use crate::host::canonicalize_host_port;
use crate::passphrase;
use crate::Result;

/// How the deployer should authenticate to the remote host.
pub enum Auth<'a> {
    /// Prefer an explicit private key (PEM). If it requires a passphrase
    /// not supplied here, the passphrase cache (spec.md §5) is consulted;
    /// if still missing, fails with `ErrPassphraseRequired`.
    PrivateKey { pem: &'a str, passphrase: Option<&'a str> },
    /// Fall back to the local SSH agent (used when the stored private
    /// key is empty, spec.md §4.C5 step 1).
    Agent,
}

pub struct Ssh2Deployer {
    session: Session,
    sftp: ssh2::Sftp,
}

impl Ssh2Deployer {
    /// Connect, verify the host key against `expected_host_key` (an
    /// authorized_keys-format line, `alg base64data`), and authenticate.
    ///
    /// This single constructor serves both the normal path (caller looked
    /// `expected_host_key` up from the Store's known-hosts table) and the
    /// bootstrap path (caller passes the operator-confirmed literal) —
    /// spec.md §4.C5 describes the bootstrap variant as using "that
    /// literal instead of the store", which from this module's point of
    /// view is the same parameter either way.
    pub fn connect(
        hostname: &str,
        username: &str,
        auth: Auth,
        expected_host_key: &str,
        dial_timeout: Duration,
        op_timeout: Duration,
    ) -> Result<Self> {
        let canonical = canonicalize_host_port(hostname);
        let (host, port) = crate::host::parse_host_port(&canonical);
        let port: u16 = if port.is_empty() { 22 } else {
            port.parse().context(ErrorKind::ErrConnectionFailed(canonical.clone(), "invalid port".to_string()))?
        };

        use std::net::ToSocketAddrs;
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .context(ErrorKind::ErrConnectionFailed(canonical.clone(), "could not resolve address".to_string()))?
            .next()
            .ok_or_else(|| ErrorKind::ErrConnectionFailed(canonical.clone(), "address resolved to nothing".to_string()))?;
        let tcp = TcpStream::connect_timeout(&addr, dial_timeout)
            .context(ErrorKind::ErrConnectionFailed(canonical.clone(), "TCP dial failed".to_string()))?;
        tcp.set_read_timeout(Some(op_timeout)).ok();
        tcp.set_write_timeout(Some(op_timeout)).ok();

        let mut session = Session::new()
            .context(ErrorKind::ErrConnectionFailed(canonical.clone(), "could not create SSH session".to_string()))?;
        session.set_tcp_stream(tcp);
        session.handshake()
            .context(ErrorKind::ErrConnectionFailed(canonical.clone(), "SSH handshake failed".to_string()))?;

        // --- host key verification -----------------------------------
        let (server_key_bytes, server_key_type) = session
            .host_key()
            .ok_or_else(|| ErrorKind::ErrConnectionFailed(canonical.clone(), "server presented no host key".to_string()))?;
        let algo = host_key_type_name(server_key_type);
        let server_line = format!("{} {}", algo, base64_encode(server_key_bytes));

        let expected = expected_host_key.trim();
        if server_line.trim() != expected {
            return Err(ErrorKind::ErrHostKeyMismatch(canonical.clone()).into());
        }

        // --- authentication --------------------------------------------
        match auth {
            Auth::PrivateKey { pem, passphrase: explicit_passphrase } => {
                if pem.is_empty() {
                    session.userauth_agent(username)
                        .context(ErrorKind::ErrConnectionFailed(canonical.clone(), "agent auth failed".to_string()))?;
                } else {
                    let pass = explicit_passphrase.map(str::to_string)
                        .or_else(|| passphrase::read().map(|b| String::from_utf8_lossy(&b).into_owned()));

                    let result = session.userauth_pubkey_memory(username, None, pem, pass.as_deref());
                    if let Err(_e) = result {
                        if pass.is_none() {
                            return Err(ErrorKind::ErrPassphraseRequired.into());
                        }
                        return Err(ErrorKind::ErrConnectionFailed(canonical.clone(), "pubkey auth failed".to_string()).into());
                    }
                }
            }
            Auth::Agent => {
                session.userauth_agent(username)
                    .context(ErrorKind::ErrConnectionFailed(canonical.clone(), "agent auth failed".to_string()))?;
            }
        }

        if !session.authenticated() {
            return Err(ErrorKind::ErrConnectionFailed(canonical.clone(), "authentication did not succeed".to_string()).into());
        }

        let sftp = session.sftp()
            .context(ErrorKind::ErrConnectionFailed(canonical, "could not open SFTP channel".to_string()))?;

        Ok(Ssh2Deployer { session, sftp })
    }

    fn remote_path(&self, suffix: &str) -> std::path::PathBuf {
        // `~` expansion is handled by libssh2/the remote shell for plain
        // relative paths under the authenticated user's home.
        std::path::Path::new(".ssh").join(suffix)
    }
}

impl Deployer for Ssh2Deployer {
    fn deploy_authorized_keys(&mut self, content: &str) -> Result<()> {
        let dir = self.remote_path("");
        if self.sftp.stat(&dir).is_err() {
            self.sftp.mkdir(&dir, 0o700)
                .context(ErrorKind::ErrDeploymentFailed("could not create ~/.ssh".to_string()))?;
        }

        let nonce = {
            use rand::Rng;
            let bytes: [u8; 8] = rand::thread_rng().gen();
            hex::encode(bytes)
        };
        let tmp_path = self.remote_path(&format!("authorized_keys.tmp.{}", nonce));
        let final_path = self.remote_path("authorized_keys");

        {
            let mut tmp_file = self.sftp
                .create(&tmp_path)
                .context(ErrorKind::ErrDeploymentFailed("could not create temp file".to_string()))?;
            tmp_file.write_all(content.as_bytes())
                .context(ErrorKind::ErrDeploymentFailed("could not write temp file".to_string()))?;
            tmp_file.flush().ok();
            // libssh2's SFTP layer has no direct fsync; closing the
            // handle flushes the write through the channel before we
            // issue the rename below, which is the atomicity boundary
            // that matters here (the old file is never touched until
            // the rename succeeds).
        }

        self.sftp.setstat(&tmp_path, ssh2::FileStat {
            size: None, uid: None, gid: None,
            perm: Some(0o600), atime: None, mtime: None,
        }).context(ErrorKind::ErrDeploymentFailed("could not chmod temp file".to_string()))?;

        self.sftp.rename(&tmp_path, &final_path, Some(ssh2::RenameFlags::OVERWRITE))
            .context(ErrorKind::ErrDeploymentFailed("could not rename temp file into place".to_string()))?;

        Ok(())
    }

    fn get_authorized_keys(&mut self) -> Result<Option<String>> {
        let path = self.remote_path("authorized_keys");
        match self.sftp.open(&path) {
            Ok(mut f) => {
                let mut buf = String::new();
                f.read_to_string(&mut buf)
                    .context(ErrorKind::ErrOther("could not read authorized_keys".to_string()))?;
                Ok(Some(buf))
            }
            Err(e) => {
                if e.to_string().contains("No such file") || e.code() == ssh2::ErrorCode::SFTP(2) {
                    Ok(None)
                } else {
                    Err(ErrorKind::ErrOther(format!("could not open authorized_keys: {}", e)).into())
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.session.disconnect(None, "done", None).ok();
        Ok(())
    }
}

impl Drop for Ssh2Deployer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn host_key_type_name(t: ssh2::HostKeyType) -> &'static str {
    match t {
        ssh2::HostKeyType::Rsa => "ssh-rsa",
        ssh2::HostKeyType::Dss => "ssh-dss",
        ssh2::HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        ssh2::HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        ssh2::HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        ssh2::HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

/// The production [`Connector`]: real `ssh2` sessions with the dial/op
/// timeouts from `Config` baked in once at construction.
pub struct Ssh2Connector {
    pub dial_timeout: Duration,
    pub op_timeout: Duration,
}

impl Ssh2Connector {
    pub fn new(dial_timeout: Duration, op_timeout: Duration) -> Self {
        Ssh2Connector { dial_timeout, op_timeout }
    }
}

impl Connector for Ssh2Connector {
    fn connect(
        &self,
        hostname: &str,
        username: &str,
        private_key_pem: &str,
        expected_host_key: &str,
    ) -> Result<Box<dyn Deployer>> {
        let deployer = Ssh2Deployer::connect(
            hostname,
            username,
            Auth::PrivateKey { pem: private_key_pem, passphrase: None },
            expected_host_key,
            self.dial_timeout,
            self.op_timeout,
        )?;
        Ok(Box::new(deployer))
    }
}

fn base64_encode(data: &[u8]) -> String {
    // authorized_keys / known_hosts lines use plain (non-URL-safe) base64;
    // the teacher already depends on the `base64` crate (shipcat_definitions
    // uses it for vault secret files), reused here for the host key line.
    base64::encode(data)
}
