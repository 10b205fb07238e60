//! Remote sessions to the device
//!
//! A [`Transport`] opens authenticated sessions; a [`RemoteSession`] runs
//! commands and uploads files until it is closed. `close` consumes the
//! session, so every session is closed at most once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::OnceCell;

use crate::config::{DeviceEndpoint, SshSettings};
use crate::error::PushError;
use crate::transfer;

/// Result of a remote command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Opens sessions to a device endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn RemoteSession>, PushError>;
}

/// A live, authenticated session owned by a single push cycle
#[async_trait]
pub trait RemoteSession: Send {
    /// Identifier unique for the process lifetime
    fn id(&self) -> u64;

    /// Run a command and wait for it to exit
    async fn execute(&mut self, command: &str) -> Result<CommandOutput, PushError>;

    /// Copy a local file to `remote_path`, returning the number of bytes written
    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<u64, PushError>;

    /// Tear down the session
    async fn close(self: Box<Self>);
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// russh client callbacks
pub struct DeviceHandler;

#[async_trait]
impl client::Handler for DeviceHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys change whenever the device's SSH server is reinstalled
        tracing::debug!("Accepting {} host key", server_public_key.name());
        Ok(true)
    }
}

/// SSH transport with public-key authentication
pub struct SshTransport {
    settings: SshSettings,
    /// Private key, loaded on first successful connect
    key: OnceCell<Arc<KeyPair>>,
}

impl SshTransport {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings,
            key: OnceCell::new(),
        }
    }

    async fn load_key(&self, path: &Path) -> Result<Arc<KeyPair>, PushError> {
        let key = self
            .key
            .get_or_try_init(|| async {
                tracing::info!("Loading private key from {}", path.display());
                let owned: PathBuf = path.to_path_buf();

                tokio::task::spawn_blocking(move || russh_keys::load_secret_key(owned, None))
                    .await
                    .map_err(|e| {
                        PushError::Connection(format!("key loading task failed: {}", e))
                    })?
                    .map(Arc::new)
                    .map_err(|e| {
                        PushError::Connection(format!(
                            "failed to load private key {}: {}",
                            path.display(),
                            e
                        ))
                    })
            })
            .await?;

        Ok(key.clone())
    }

    fn client_config(&self) -> client::Config {
        client::Config {
            keepalive_interval: Some(self.settings.keepalive_interval),
            keepalive_max: self.settings.keepalive_max,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn RemoteSession>, PushError> {
        let key = self.load_key(&endpoint.key_path).await?;
        let config = Arc::new(self.client_config());
        let target = format!("{}@{}:{}", endpoint.username, endpoint.address, endpoint.port);

        tracing::debug!("Connecting to {}", target);

        let handshake = async {
            let mut handle = client::connect(
                config,
                (endpoint.address.as_str(), endpoint.port),
                DeviceHandler,
            )
            .await?;
            let authenticated = handle
                .authenticate_publickey(endpoint.username.clone(), key)
                .await?;
            Ok::<_, russh::Error>((handle, authenticated))
        };

        // Dropping the handshake future on timeout drops the half-open handle
        let handle = match tokio::time::timeout(self.settings.handshake_timeout, handshake).await {
            Err(_) => {
                return Err(PushError::Connection(format!(
                    "handshake with {} timed out after {}ms",
                    target,
                    self.settings.handshake_timeout.as_millis()
                )))
            }
            Ok(Err(e)) => {
                return Err(PushError::Connection(format!(
                    "failed to connect to {}: {}",
                    target, e
                )))
            }
            Ok(Ok((handle, false))) => {
                disconnect(&handle).await;
                return Err(PushError::Connection(format!(
                    "public key rejected by {}",
                    target
                )));
            }
            Ok(Ok((handle, true))) => handle,
        };

        let session = SshSession {
            id: next_session_id(),
            handle,
            command_timeout: self.settings.command_timeout,
        };
        tracing::debug!("Session {} open to {}", session.id, target);

        Ok(Box::new(session))
    }
}

/// An authenticated russh session
pub struct SshSession {
    id: u64,
    handle: Handle<DeviceHandler>,
    command_timeout: Duration,
}

#[async_trait]
impl RemoteSession for SshSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput, PushError> {
        let mut channel = self.handle.channel_open_session().await.map_err(|e| {
            PushError::Execution(format!("failed to open channel for `{}`: {}", command, e))
        })?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| PushError::Execution(format!("failed to run `{}`: {}", command, e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        // Drain until the channel closes; the exit status may arrive before trailing output
        let drain = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    _ => {}
                }
            }
        };

        if tokio::time::timeout(self.command_timeout, drain).await.is_err() {
            if let Err(e) = channel.close().await {
                tracing::debug!("Failed to close channel for `{}`: {}", command, e);
            }
            return Err(PushError::Execution(format!(
                "`{}` timed out after {}ms",
                command,
                self.command_timeout.as_millis()
            )));
        }

        let exit_code = exit_code.ok_or_else(|| {
            PushError::Execution(format!("`{}` ended without an exit status", command))
        })?;

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<u64, PushError> {
        transfer::upload(&self.handle, local_path, remote_path).await
    }

    async fn close(self: Box<Self>) {
        tracing::debug!("Closing session {}", self.id);
        disconnect(&self.handle).await;
    }
}

async fn disconnect(handle: &Handle<DeviceHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        tracing::debug!("Disconnect failed: {}", e);
    }
}
