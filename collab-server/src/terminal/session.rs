//! One-time terminal sessions handed over through the fast cache.

use std::fmt;

use serde::Deserialize;
use uuid::Uuid;

use crate::cache::{terminal_session_key, FastCache};
use crate::error::TerminalError;

const PATH_PREFIX: &str = "/terminal/";

fn default_port() -> u16 {
    22
}

/// Credential bundle stored under `terminal_session:<uuid>`.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "privateKey")]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// How to authenticate against the remote host.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthMethod<'a> {
    Key {
        pem: &'a str,
        passphrase: Option<&'a str>,
    },
    Password(&'a str),
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl Credentials {
    /// Key authentication wins when a key is present.
    pub fn auth_method(&self) -> Result<AuthMethod<'_>, TerminalError> {
        if let Some(pem) = present(&self.private_key) {
            return Ok(AuthMethod::Key {
                pem,
                passphrase: present(&self.passphrase),
            });
        }
        match present(&self.password) {
            Some(password) => Ok(AuthMethod::Password(password)),
            None => Err(TerminalError::InvalidSession(
                "no password or private key".to_string(),
            )),
        }
    }
}

// Secrets stay out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Whether `path` belongs to the terminal gateway.
pub fn is_terminal_path(path: &str) -> bool {
    path.starts_with(PATH_PREFIX)
}

/// Session id of a `/terminal/<uuid>` path.
pub fn parse_session_path(path: &str) -> Result<Uuid, TerminalError> {
    path.strip_prefix(PATH_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or(TerminalError::InvalidPath)
}

/// Consume a session: atomically read and delete its credentials.
///
/// A second call with the same id fails with `SessionNotFound`, whatever
/// happened to the first connection.
pub async fn consume(cache: &dyn FastCache, session_id: &Uuid) -> Result<Credentials, TerminalError> {
    let key = terminal_session_key(session_id);
    let raw = cache.take(&key).await?.ok_or(TerminalError::SessionNotFound)?;
    let credentials: Credentials =
        serde_json::from_str(&raw).map_err(|e| TerminalError::InvalidSession(e.to_string()))?;
    credentials.auth_method()?;
    log::info!(
        "Consumed terminal session {session_id} for {}@{}:{}",
        credentials.username,
        credentials.host,
        credentials.port
    );
    Ok(credentials)
}
