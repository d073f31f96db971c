//! `Transport` implementation over russh.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{AuthResult, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::ChannelMsg;
use russh_sftp::client::fs::File as SftpFile;
use russh_sftp::client::SftpSession;
use tokio::time::timeout;
use tracing::debug;

use crate::transport::{
    CommandOutput, ConnectionTarget, Credential, ExecSession, FileSession, Link, Transport,
    TransportError,
};

/// Extended data stream number SSH uses for stderr.
const STDERR_STREAM: u32 = 1;

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::UnknownKey | russh::Error::WrongServerSig => {
                TransportError::Fatal(e.to_string())
            }
            _ => TransportError::Transient(e.to_string()),
        }
    }
}

impl From<russh_sftp::client::error::Error> for TransportError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        TransportError::Transient(e.to_string())
    }
}

pub struct ClientHandler {
    host: String,
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    /// Host keys are not checked against known_hosts.
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(russh::keys::ssh_key::HashAlg::Sha256),
            "accepting server key"
        );
        async { Ok(true) }
    }
}

pub struct SshTransport {
    config: Arc<russh::client::Config>,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        let mut config = russh::client::Config::default();
        config.inactivity_timeout = None;
        config.keepalive_interval = Some(Duration::from_secs(30));
        config.keepalive_max = 3;
        Self {
            config: Arc::new(config),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    type Link = SshLink;

    async fn dial(
        &self,
        target: &ConnectionTarget,
        credential: &Credential,
    ) -> Result<SshLink, TransportError> {
        let handler = ClientHandler {
            host: target.host.clone(),
        };
        let addr = (target.host.as_str(), target.port);
        let mut handle = timeout(
            self.connect_timeout,
            russh::client::connect(self.config.clone(), addr, handler),
        )
        .await
        .map_err(|_| {
            TransportError::transient(format!(
                "connection to {} timed out after {}s",
                target,
                self.connect_timeout.as_secs()
            ))
        })??;

        let result = match credential {
            Credential::Password(secret) => {
                handle
                    .authenticate_password(target.username.clone(), secret.expose())
                    .await?
            }
            Credential::Key { key, .. } => {
                // Prefer SHA-256 for RSA keys; ignored for other key types.
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                let key = PrivateKeyWithHashAlg::new(key.clone(), hash);
                handle
                    .authenticate_publickey(target.username.clone(), key)
                    .await?
            }
        };

        match result {
            AuthResult::Success => Ok(SshLink { handle }),
            AuthResult::Failure {
                remaining_methods, ..
            } => Err(TransportError::Rejected(format!(
                "unable to authenticate as {} with {:?}; server allows {:?}",
                target.username, credential, remaining_methods
            ))),
        }
    }
}

pub struct SshLink {
    handle: Handle<ClientHandler>,
}

#[async_trait]
impl Link for SshLink {
    type Exec = SshExec;
    type Files = SftpFiles;

    async fn open_exec(&self) -> Result<SshExec, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        Ok(SshExec { channel })
    }

    async fn open_files(&self) -> Result<SftpFiles, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(SftpFiles { sftp })
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

pub struct SshExec {
    channel: russh::Channel<Msg>,
}

#[async_trait]
impl ExecSession for SshExec {
    async fn run(mut self, command: &str) -> Result<CommandOutput, TransportError> {
        self.channel.exec(true, command).await?;

        let mut output = CommandOutput::default();
        // The exit status may arrive after EOF, so only a close ends the loop.
        while let Some(msg) = self.channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } if ext == STDERR_STREAM => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok(output)
    }
}

pub struct SftpFiles {
    sftp: SftpSession,
}

#[async_trait]
impl FileSession for SftpFiles {
    type Reader = SftpFile;
    type Writer = SftpFile;

    async fn open(&self, path: &str) -> Result<SftpFile, TransportError> {
        Ok(self.sftp.open(path).await?)
    }

    async fn create(&self, path: &str) -> Result<SftpFile, TransportError> {
        Ok(self.sftp.create(path).await?)
    }

    async fn close(self) -> Result<(), TransportError> {
        Ok(self.sftp.close().await?)
    }
}
