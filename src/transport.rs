//! Transport seam.
//!
//! A `Transport` knows how to dial a remote host with a given credential and
//! hand back a live `Link`. A `Link` opens short-lived sessions on top of
//! itself: exec sessions for running one command, and file sessions for bulk
//! transfer. The real implementation lives in `ssh`; tests plug in mocks.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Failure reported by the transport, classified where it happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network or session trouble that may go away on its own.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// The remote end refused the credential.
    #[error("credential rejected by remote host: {0}")]
    Rejected(String),
    /// Retrying cannot help (protocol or host key mismatch).
    #[error("fatal transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn transient(msg: impl fmt::Display) -> Self {
        Self::Transient(msg.to_string())
    }
}

/// A password-equivalent secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Where to connect and as whom.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<Secret>,
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// The authentication method settled on by the resolver.
#[derive(Clone)]
pub enum Credential {
    Password(Secret),
    Key {
        /// File the key was loaded from.
        path: PathBuf,
        key: Arc<russh::keys::PrivateKey>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::Key { path, .. } => write!(f, "Key({})", path.display()),
        }
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit status reported by the remote end, if any was sent.
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// A command that never reported a status is treated as failed.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    type Link: Link;

    /// Connect and authenticate in one go.
    async fn dial(
        &self,
        target: &ConnectionTarget,
        credential: &Credential,
    ) -> Result<Self::Link, TransportError>;
}

/// A connected, authenticated transport.
#[async_trait]
pub trait Link: Send + Sync {
    type Exec: ExecSession;
    type Files: FileSession;

    async fn open_exec(&self) -> Result<Self::Exec, TransportError>;

    async fn open_files(&self) -> Result<Self::Files, TransportError>;

    /// Whether the underlying connection is known to be gone.
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait ExecSession: Send {
    /// Run `command` to completion, collecting both output streams.
    async fn run(self, command: &str) -> Result<CommandOutput, TransportError>;
}

#[async_trait]
pub trait FileSession: Send + Sync {
    type Reader: AsyncRead + Unpin + Send;
    type Writer: AsyncWrite + Unpin + Send;

    async fn open(&self, path: &str) -> Result<Self::Reader, TransportError>;

    async fn create(&self, path: &str) -> Result<Self::Writer, TransportError>;

    async fn close(self) -> Result<(), TransportError>;
}
