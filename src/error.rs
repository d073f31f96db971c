use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::slurm::ParseError;
use crate::token::TokenError;
use crate::transport::TransportError;

/// Failures surfaced by `Channel` operations.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("maximum retries reached for SSH connection ({attempts} attempts)")]
    Exhausted { attempts: u32 },
    #[error("SSH authentication failed: {0}")]
    Rejected(String),
    #[error("SSH connection cannot be established: {0}")]
    Fatal(String),
    /// The session was opened but using it failed.
    #[error("remote session failed: {0}")]
    Transport(#[from] TransportError),
    #[error("local file {}: {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything that ends the process early.
#[derive(Error, Debug)]
pub enum SlurmSshError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to get auth: {0}")]
    Auth(#[from] AuthError),
    #[error("SSH failure: {0}")]
    Channel(#[from] ChannelError),
    #[error("Malformed remote output: {0}")]
    MalformedRemoteOutput(#[from] ParseError),
    #[error("Job id file: {0}")]
    Token(#[from] TokenError),
    #[error("Submit slurm job failed (exit status {status:?}): {stderr}")]
    SubmitFailed { status: Option<u32>, stderr: String },
    #[error("Failed to write job output: {0}")]
    Output(#[from] std::io::Error),
}
