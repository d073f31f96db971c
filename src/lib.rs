//! slurm-ssh: submit a Slurm job over SSH and follow it like a local process.

// Command line arguments and configuration file.
pub mod config;
// Remote command and file transfer seam.
pub mod transport;
// russh-backed transport.
pub mod ssh;
// Retry policy for session requests.
pub mod retry;
// Picking a credential.
pub mod auth;
// Reconnecting channel on top of a transport.
pub mod channel;
// Slurm command lines and output parsing.
pub mod slurm;
// Persisted job id.
pub mod token;
// Submit, poll, mirror the log, finish.
pub mod job;
// Error handling.
pub mod error;

#[cfg(test)]
mod testing;

pub use auth::{AuthError, AuthResolver};
pub use channel::{Channel, ChannelConfig};
pub use config::{Cli, Config, ConfigError};
pub use error::{ChannelError, SlurmSshError};
pub use job::{JobController, JobSpec};
pub use retry::{Retries, RetryPolicy};
pub use slurm::{JobId, JobInfo, JobState, ParseError};
pub use ssh::SshTransport;
pub use token::JobIdFile;
pub use transport::{
    CommandOutput, ConnectionTarget, Credential, ExecSession, FileSession, Link, Secret,
    Transport, TransportError,
};
