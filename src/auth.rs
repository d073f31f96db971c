//! Authentication resolver.
//!
//! Picks the credential a `Channel` will use for its whole life. An explicit
//! password wins outright. Otherwise the conventional identity files are
//! tried in a fixed order and the first one the remote host accepts is kept.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::{ConnectionTarget, Credential, Transport, TransportError};

/// Identity files under the key directory, in the order they are tried.
pub const IDENTITY_FILES: [&str; 4] = ["id_rsa", "id_dsa", "id_ecdsa", "id_ed25519"];

/// Wait before redialing with the same key after a non-auth failure.
const PROBE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("cannot locate home directory to find SSH keys")]
    NoHome,
    #[error("failed to load private key {}: {source}", path.display())]
    Key {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },
    #[error("failed to authenticate: no identity in {} was accepted", dir.display())]
    Exhausted { dir: PathBuf },
    #[error("failed to authenticate: {0}")]
    Fatal(String),
}

/// Outcome of resolution: the credential, plus the connection used to
/// prove it if one had to be made.
pub struct Resolved<L> {
    pub credential: Credential,
    pub link: Option<L>,
}

pub struct AuthResolver {
    key_dir: PathBuf,
    backoff: Duration,
}

impl AuthResolver {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            backoff: PROBE_BACKOFF,
        }
    }

    /// Resolver looking in `~/.ssh`.
    pub fn from_home() -> Result<Self, AuthError> {
        let home = dirs::home_dir().ok_or(AuthError::NoHome)?;
        Ok(Self::new(home.join(".ssh")))
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Identity files that exist, in priority order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        IDENTITY_FILES
            .iter()
            .map(|name| self.key_dir.join(name))
            .filter(|path| path.exists())
            .collect()
    }

    pub async fn resolve<T: Transport>(
        &self,
        transport: &T,
        target: &ConnectionTarget,
    ) -> Result<Resolved<T::Link>, AuthError> {
        if let Some(secret) = &target.password {
            debug!(remote = %target, "using password authentication");
            return Ok(Resolved {
                credential: Credential::Password(secret.clone()),
                link: None,
            });
        }

        for path in self.candidates() {
            // A key that cannot be read or parsed ends resolution.
            let key = russh::keys::load_secret_key(&path, None).map_err(|source| {
                AuthError::Key {
                    path: path.clone(),
                    source,
                }
            })?;
            let credential = Credential::Key {
                path: path.clone(),
                key: Arc::new(key),
            };
            info!(remote = %target, key = %path.display(), "trying identity");
            if let Some(link) = self.probe(transport, target, &credential).await? {
                info!(remote = %target, key = %path.display(), "identity accepted");
                return Ok(Resolved {
                    credential,
                    link: Some(link),
                });
            }
        }

        Err(AuthError::Exhausted {
            dir: self.key_dir.clone(),
        })
    }

    /// Dial until the host either accepts or rejects `credential`.
    async fn probe<T: Transport>(
        &self,
        transport: &T,
        target: &ConnectionTarget,
        credential: &Credential,
    ) -> Result<Option<T::Link>, AuthError> {
        loop {
            match transport.dial(target, credential).await {
                Ok(link) => return Ok(Some(link)),
                Err(TransportError::Rejected(reason)) => {
                    debug!(remote = %target, "identity rejected: {}", reason);
                    return Ok(None);
                }
                Err(TransportError::Fatal(reason)) => return Err(AuthError::Fatal(reason)),
                Err(TransportError::Transient(reason)) => {
                    warn!(remote = %target, "failed to dial: {}", reason);
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}
