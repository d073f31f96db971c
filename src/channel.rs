//! Resilient remote channel.
//!
//! A `Channel` owns at most one live `Link`. Every operation first asks for a
//! fresh session on that link; if there is no link it dials one. When the
//! dial or the session request fails the link is thrown away, so the next
//! attempt starts from a full reconnect. Only failures to get a session are
//! retried: once a command runs, its outcome (including a non-zero exit
//! status) goes back to the caller as is.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthResolver};
use crate::error::ChannelError;
use crate::retry::RetryPolicy;
use crate::transport::{
    CommandOutput, ConnectionTarget, Credential, ExecSession, FileSession, Link, Transport,
    TransportError,
};

/// Transfer chunk size for uploads and downloads.
const CHUNK_SIZE: usize = 32 * 1024;

/// Immutable once the resolver has settled on a credential.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub target: ConnectionTarget,
    pub credential: Credential,
}

pub struct Channel<T: Transport> {
    transport: T,
    config: ChannelConfig,
    link: Option<T::Link>,
}

impl<T: Transport> Channel<T> {
    /// Create a channel that will connect lazily on first use.
    pub fn new(transport: T, config: ChannelConfig) -> Self {
        Self {
            transport,
            config,
            link: None,
        }
    }

    /// Resolve the credential for `target` and build a channel around it.
    ///
    /// If resolution had to dial the host to probe keys, the accepted
    /// connection becomes the channel's live link.
    pub async fn establish(
        transport: T,
        target: ConnectionTarget,
        resolver: &AuthResolver,
    ) -> Result<Self, AuthError> {
        let resolved = resolver.resolve(&transport, &target).await?;
        Ok(Self {
            transport,
            config: ChannelConfig {
                target,
                credential: resolved.credential,
            },
            link: resolved.link,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Whether a link is currently held. It may still turn out to be dead.
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Run `command` in a fresh exec session.
    pub async fn run_command(
        &mut self,
        command: &str,
        policy: RetryPolicy,
    ) -> Result<CommandOutput, ChannelError> {
        let exec = self.acquire::<ExecKind>(policy).await?;
        debug!(command, "running remote command");
        Ok(exec.run(command).await?)
    }

    /// Copy a local file to `remote`, chunk by chunk.
    pub async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        policy: RetryPolicy,
    ) -> Result<(), ChannelError> {
        let files = self.acquire::<FilesKind>(policy).await?;
        let copied = upload_file(&files, local, remote).await;
        let closed = files.close().await;
        let bytes = copied?;
        closed?;
        info!(bytes, local = %local.display(), remote, "uploaded file");
        Ok(())
    }

    /// Copy the remote file at `remote` to `local`, replacing it.
    pub async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        policy: RetryPolicy,
    ) -> Result<(), ChannelError> {
        let files = self.acquire::<FilesKind>(policy).await?;
        let copied = download_file(&files, remote, local).await;
        let closed = files.close().await;
        let bytes = copied?;
        closed?;
        info!(bytes, remote, local = %local.display(), "downloaded file");
        Ok(())
    }

    async fn acquire<K: SessionKind<T::Link>>(
        &mut self,
        policy: RetryPolicy,
    ) -> Result<K::Session, ChannelError> {
        let mut failures = 0u32;
        loop {
            match self.try_acquire::<K>().await {
                Ok(session) => return Ok(session),
                Err(TransportError::Rejected(reason)) => return Err(ChannelError::Rejected(reason)),
                Err(TransportError::Fatal(reason)) => return Err(ChannelError::Fatal(reason)),
                Err(TransportError::Transient(reason)) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        remote = %self.config.target,
                        attempt = failures,
                        "failed to open {} session: {}",
                        K::NAME,
                        reason
                    );
                }
            }
            if !policy.allows_retry(failures) {
                return Err(ChannelError::Exhausted { attempts: failures });
            }
            tokio::time::sleep(policy.interval).await;
        }
    }

    async fn try_acquire<K: SessionKind<T::Link>>(
        &mut self,
    ) -> Result<K::Session, TransportError> {
        let link = match self.link.take() {
            Some(link) if !link.is_closed() => link,
            _ => {
                debug!(remote = %self.config.target, "dialing");
                let link = self
                    .transport
                    .dial(&self.config.target, &self.config.credential)
                    .await?;
                info!(remote = %self.config.target, "connected");
                link
            }
        };
        // On failure the link is dropped here and the next attempt redials.
        let session = K::open(&link).await?;
        self.link = Some(link);
        Ok(session)
    }
}

/// The kind of session an operation needs from a link.
#[async_trait]
trait SessionKind<L: Link> {
    type Session: Send;
    const NAME: &'static str;

    async fn open(link: &L) -> Result<Self::Session, TransportError>;
}

struct ExecKind;

#[async_trait]
impl<L: Link> SessionKind<L> for ExecKind {
    type Session = L::Exec;
    const NAME: &'static str = "exec";

    async fn open(link: &L) -> Result<L::Exec, TransportError> {
        link.open_exec().await
    }
}

struct FilesKind;

#[async_trait]
impl<L: Link> SessionKind<L> for FilesKind {
    type Session = L::Files;
    const NAME: &'static str = "sftp";

    async fn open(link: &L) -> Result<L::Files, TransportError> {
        link.open_files().await
    }
}

async fn upload_file<F: FileSession>(
    files: &F,
    local: &Path,
    remote: &str,
) -> Result<u64, ChannelError> {
    let local_err = |source| ChannelError::Local {
        path: local.to_path_buf(),
        source,
    };
    let mut src = tokio::fs::File::open(local).await.map_err(local_err)?;
    let mut dst = files.create(remote).await?;
    let copied = copy_chunks(&mut src, &mut dst, local_err, remote_err).await;
    let closed = dst.shutdown().await.map_err(remote_err);
    let bytes = copied?;
    closed?;
    Ok(bytes)
}

async fn download_file<F: FileSession>(
    files: &F,
    remote: &str,
    local: &Path,
) -> Result<u64, ChannelError> {
    let local_err = |source| ChannelError::Local {
        path: local.to_path_buf(),
        source,
    };
    let mut src = files.open(remote).await?;
    let mut dst = tokio::fs::File::create(local).await.map_err(local_err)?;
    let copied = copy_chunks(&mut src, &mut dst, remote_err, local_err).await;
    let flushed = dst.flush().await.map_err(local_err);
    let bytes = copied?;
    flushed?;
    Ok(bytes)
}

fn remote_err(e: io::Error) -> ChannelError {
    ChannelError::Transport(TransportError::transient(e))
}

async fn copy_chunks<R, W>(
    src: &mut R,
    dst: &mut W,
    read_err: impl Fn(io::Error) -> ChannelError,
    write_err: impl Fn(io::Error) -> ChannelError,
) -> Result<u64, ChannelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await.map_err(&read_err)?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await.map_err(&write_err)?;
        total += n as u64;
    }
}
