//! Remote shell over SSH.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;

use crate::config::ServerConfig;
use crate::error::TerminalError;
use crate::terminal::session::{AuthMethod, Credentials};

const TERM: &str = "xterm-256color";

/// Initial pseudo-terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Opens interactive shells on remote hosts.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn open(
        &self,
        credentials: &Credentials,
        size: PtySize,
    ) -> Result<Box<dyn RemoteShell>, TerminalError>;
}

/// An open interactive shell.
///
/// `read` must be cancel-safe: the gateway polls it inside `select!`.
#[async_trait]
pub trait RemoteShell: Send {
    /// Next chunk of stdout/stderr, or None once the shell has ended.
    async fn read(&mut self) -> Option<Vec<u8>>;

    async fn write(&mut self, data: &[u8]) -> Result<(), TerminalError>;

    async fn resize(&mut self, size: PtySize) -> Result<(), TerminalError>;

    /// Tear down the remote session. Idempotent.
    async fn close(&mut self);
}

struct HostKeyPolicy;

#[async_trait]
impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    // Host identity is vouched for by whoever minted the session
    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// [`ShellConnector`] backed by russh.
pub struct SshConnector {
    connect_timeout: Duration,
    keepalive: Duration,
}

impl SshConnector {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            connect_timeout: config.ssh_connect_timeout,
            keepalive: config.ssh_keepalive,
        }
    }

    async fn authenticate(
        handle: &mut Handle<HostKeyPolicy>,
        credentials: &Credentials,
    ) -> Result<(), TerminalError> {
        let accepted = match credentials.auth_method()? {
            AuthMethod::Key { pem, passphrase } => {
                let key = russh_keys::decode_secret_key(pem, passphrase)
                    .map_err(|e| TerminalError::InvalidKey(e.to_string()))?;
                handle
                    .authenticate_publickey(&credentials.username, Arc::new(key))
                    .await?
            }
            AuthMethod::Password(password) => {
                handle
                    .authenticate_password(&credentials.username, password)
                    .await?
            }
        };
        if !accepted {
            return Err(TerminalError::AuthFailed {
                host: credentials.host.clone(),
                username: credentials.username.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn open(
        &self,
        credentials: &Credentials,
        size: PtySize,
    ) -> Result<Box<dyn RemoteShell>, TerminalError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.keepalive),
            ..Default::default()
        });
        let address = (credentials.host.as_str(), credentials.port);

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, address, HostKeyPolicy),
        )
        .await
        .map_err(|_| TerminalError::ConnectTimeout {
            host: credentials.host.clone(),
            port: credentials.port,
        })??;
        log::debug!("SSH transport up to {}:{}", credentials.host, credentials.port);

        if let Err(e) = Self::authenticate(&mut handle, credentials).await {
            disconnect(&handle).await;
            return Err(e);
        }

        let channel = match open_shell(&handle, size).await {
            Ok(channel) => channel,
            Err(e) => {
                disconnect(&handle).await;
                return Err(e);
            }
        };

        Ok(Box::new(SshShell {
            handle,
            channel,
            closed: false,
        }))
    }
}

async fn open_shell(handle: &Handle<HostKeyPolicy>, size: PtySize) -> Result<Channel<Msg>, TerminalError> {
    let shell_error = |e: russh::Error| TerminalError::ShellOpen(e.to_string());
    let channel = handle.channel_open_session().await.map_err(shell_error)?;
    channel
        .request_pty(false, TERM, size.cols, size.rows, 0, 0, &[])
        .await
        .map_err(shell_error)?;
    channel.request_shell(false).await.map_err(shell_error)?;
    Ok(channel)
}

async fn disconnect(handle: &Handle<HostKeyPolicy>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        log::debug!("SSH disconnect: {e}");
    }
}

struct SshShell {
    handle: Handle<HostKeyPolicy>,
    channel: Channel<Msg>,
    closed: bool,
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn read(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(data.to_vec()),
                ChannelMsg::ExtendedData { data, .. } => return Some(data.to_vec()),
                ChannelMsg::ExitStatus { exit_status } => {
                    log::debug!("Remote shell exited with {exit_status}");
                }
                ChannelMsg::Eof | ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn resize(&mut self, size: PtySize) -> Result<(), TerminalError> {
        self.channel.window_change(size.cols, size.rows, 0, 0).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.channel.eof().await;
        disconnect(&self.handle).await;
    }
}
