//! In-memory `Deployer` test double standing in for a real SSH/SFTP
//! session, the same role `mockito` plays for the teacher's one HTTP
//! dependency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::deploy::{Connector, Deployer};
use crate::error::ErrorKind;
use crate::Result;

/// Shared "remote filesystem" so a test can deploy with one handle and
/// assert against the result with another, or simulate a fresh connection
/// to the same host later in the test.
#[derive(Default, Clone)]
pub struct FakeRemoteFs {
    files: Arc<Mutex<HashMap<String, String>>>,
}

impl FakeRemoteFs {
    pub fn new() -> Self { FakeRemoteFs::default() }

    pub fn preset(&self, host_key: &str, content: &str) {
        self.files.lock().unwrap().insert(host_key.to_string(), content.to_string());
    }

    pub fn content(&self, host_key: &str) -> Option<String> {
        self.files.lock().unwrap().get(host_key).cloned()
    }
}

pub struct FakeDeployer {
    fs: FakeRemoteFs,
    key: String,
    pub fail_next_deploy: bool,
    pub connect_should_fail: Option<String>,
}

impl FakeDeployer {
    pub fn new(fs: FakeRemoteFs, host_key: &str) -> Self {
        FakeDeployer { fs, key: host_key.to_string(), fail_next_deploy: false, connect_should_fail: None }
    }
}

impl Deployer for FakeDeployer {
    fn deploy_authorized_keys(&mut self, content: &str) -> Result<()> {
        if self.fail_next_deploy {
            self.fail_next_deploy = false;
            return Err(ErrorKind::ErrDeploymentFailed("simulated failure".to_string()).into());
        }
        self.fs.files.lock().unwrap().insert(self.key.clone(), content.to_string());
        Ok(())
    }

    fn get_authorized_keys(&mut self) -> Result<Option<String>> {
        Ok(self.fs.content(&self.key))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Test double for [`Connector`]: hands out [`FakeDeployer`]s backed by a
/// shared [`FakeRemoteFs`], and can be told what "real" host key each
/// hostname presents so the engine tests can exercise host-key-mismatch
/// the same way a real `Ssh2Connector` would refuse a MITM.
#[derive(Clone, Default)]
pub struct FakeConnector {
    fs: FakeRemoteFs,
    real_host_keys: Arc<Mutex<HashMap<String, String>>>,
    pub fail_next_connect: Arc<Mutex<Option<String>>>,
}

impl FakeConnector {
    pub fn new(fs: FakeRemoteFs) -> Self {
        FakeConnector { fs, real_host_keys: Arc::new(Mutex::new(HashMap::new())), fail_next_connect: Arc::new(Mutex::new(None)) }
    }

    /// Record what host key `hostname` "really" presents. If unset,
    /// `connect` accepts whatever `expected_host_key` it's given.
    pub fn set_host_key(&self, hostname: &str, line: &str) {
        self.real_host_keys.lock().unwrap().insert(hostname.to_string(), line.to_string());
    }

    pub fn fs(&self) -> FakeRemoteFs {
        self.fs.clone()
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        hostname: &str,
        _username: &str,
        _private_key_pem: &str,
        expected_host_key: &str,
    ) -> Result<Box<dyn Deployer>> {
        if let Some(reason) = self.fail_next_connect.lock().unwrap().take() {
            return Err(ErrorKind::ErrConnectionFailed(hostname.to_string(), reason).into());
        }
        if let Some(real) = self.real_host_keys.lock().unwrap().get(hostname) {
            if real.trim() != expected_host_key.trim() {
                return Err(ErrorKind::ErrHostKeyMismatch(hostname.to_string()).into());
            }
        }
        Ok(Box::new(FakeDeployer::new(self.fs.clone(), hostname)))
    }
}
