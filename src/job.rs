//! Job lifecycle controller.
//!
//! Submits the batch script unless a previous run already did, then polls
//! the job every `interval`, mirrors new log bytes to the output as they
//! appear, and stops once the job reaches a terminal state.

use std::io::Write;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::Config;
use crate::error::SlurmSshError;
use crate::retry::RetryPolicy;
use crate::slurm::{self, JobId, JobInfo};
use crate::token::JobIdFile;
use crate::transport::Transport;

/// What to submit and how often to look at it.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub workdir: String,
    pub script_file: String,
    pub interval: Duration,
    pub submit_retry_interval: Duration,
}

impl From<&Config> for JobSpec {
    fn from(config: &Config) -> Self {
        Self {
            workdir: config.workdir.clone(),
            script_file: config.script_file.clone(),
            interval: config.interval,
            submit_retry_interval: config.submit_retry_interval,
        }
    }
}

pub struct JobController<T: Transport, W: Write> {
    channel: Channel<T>,
    spec: JobSpec,
    token: JobIdFile,
    out: W,
    info: JobInfo,
    /// Bytes of the remote log already written to `out`.
    log_cursor: u64,
}

impl<T: Transport, W: Write> JobController<T, W> {
    pub fn new(channel: Channel<T>, spec: JobSpec, token: JobIdFile, out: W) -> Self {
        Self {
            channel,
            spec,
            token,
            out,
            info: JobInfo::default(),
            log_cursor: 0,
        }
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn log_cursor(&self) -> u64 {
        self.log_cursor
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Follow the job to the end and return the local exit code.
    pub async fn run(&mut self) -> Result<i32, SlurmSshError> {
        let id = self.acquire_job_id().await?;
        info!(job = %id, "following job");

        let code = loop {
            tokio::time::sleep(self.spec.interval).await;
            if let Some(code) = self.tick(id).await? {
                break code;
            }
        };

        info!(job = %id, state = %self.info.state, exit_code = code, "job finished");
        if let Err(e) = self.token.remove() {
            warn!("{}", e);
        }
        Ok(code)
    }

    /// One poll: refresh the status, pull new log bytes, and report the exit
    /// code if the job is over.
    pub async fn tick(&mut self, id: JobId) -> Result<Option<i32>, SlurmSshError> {
        self.info = self.poll_status(id).await?;
        let copied = self.sync_log(id).await?;
        debug!(
            job = %id,
            state = %self.info.state,
            copied,
            cursor = self.log_cursor,
            "poll"
        );
        Ok(self.info.final_exit_code())
    }

    /// Reuse the id left by an earlier run, or submit and record a new one.
    pub async fn acquire_job_id(&mut self) -> Result<JobId, SlurmSshError> {
        if let Some(id) = self.token.load() {
            info!(job = %id, file = %self.token.path().display(), "resuming submitted job");
            return Ok(id);
        }
        let id = self.submit().await?;
        self.token.save(id)?;
        info!(job = %id, "submitted job");
        Ok(id)
    }

    pub async fn submit(&mut self) -> Result<JobId, SlurmSshError> {
        let command = slurm::submit_command(&self.spec.workdir, &self.spec.script_file);
        let policy = RetryPolicy::forever(self.spec.submit_retry_interval);
        let output = self.channel.run_command(&command, policy).await?;
        self.out.write_all(&output.stdout)?;
        self.out.write_all(&output.stderr)?;
        self.out.flush()?;
        if !output.success() {
            return Err(SlurmSshError::SubmitFailed {
                status: output.exit_status,
                stderr: output.stderr_lossy(),
            });
        }
        Ok(slurm::parse_submission(&output.stdout_lossy())?)
    }

    /// Current job status. Any failure to query reads as `UNKNOWN`, so a
    /// host that is down or refusing logins never ends the follow loop.
    pub async fn poll_status(&mut self, id: JobId) -> Result<JobInfo, SlurmSshError> {
        let command = slurm::status_command(id);
        match self.channel.run_command(&command, RetryPolicy::once()).await {
            Ok(output) if output.success() => Ok(slurm::parse_job_info(&output.stdout_lossy())?),
            Ok(output) => {
                warn!(
                    job = %id,
                    status = ?output.exit_status,
                    "status query failed: {}",
                    output.stderr_lossy().trim_end()
                );
                Ok(JobInfo::unknown())
            }
            Err(e) => {
                warn!(job = %id, "status query failed: {}", e);
                Ok(JobInfo::unknown())
            }
        }
    }

    /// Copy log bytes past the cursor to the output. Returns how many were
    /// copied; zero when the log does not exist yet or the host cannot be
    /// reached.
    pub async fn sync_log(&mut self, id: JobId) -> Result<u64, SlurmSshError> {
        let command = slurm::log_command(&self.spec.workdir, id, self.log_cursor);
        let output = match self.channel.run_command(&command, RetryPolicy::once()).await {
            Ok(output) if output.success() => output,
            Ok(_) => return Ok(0),
            Err(e) => {
                warn!(job = %id, "log sync skipped: {}", e);
                return Ok(0);
            }
        };
        let copied = slurm::parse_transfer_count(&output.stderr_lossy())?;
        self.out.write_all(&output.stdout)?;
        self.out.flush()?;
        self.log_cursor += copied;
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::channel::ChannelConfig;
    use crate::testing::{output, MockTransport};
    use crate::transport::{ConnectionTarget, Credential, Secret, TransportError};

    fn controller(
        transport: &MockTransport,
        token: JobIdFile,
    ) -> JobController<MockTransport, Vec<u8>> {
        let channel = Channel::new(
            transport.clone(),
            ChannelConfig {
                target: ConnectionTarget {
                    host: "h".to_string(),
                    port: 22,
                    username: "u".to_string(),
                    password: Some(Secret::new("p")),
                },
                credential: Credential::Password(Secret::new("p")),
            },
        );
        let spec = JobSpec {
            workdir: "/w".to_string(),
            script_file: "run.sh".to_string(),
            interval: Duration::ZERO,
            submit_retry_interval: Duration::ZERO,
        };
        JobController::new(channel, spec, token, Vec::new())
    }

    fn dd_trailer(n: usize) -> String {
        format!("{n}+0 records in\n{n}+0 records out\n{n} bytes copied, 0.01 s, 1 kB/s\n")
    }

    #[tokio::test]
    async fn test_empty_syncs_keep_cursor_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(|_| Ok(output("", &dd_trailer(0), 0)));
        let mut controller = controller(&transport, JobIdFile::new(dir.path().join("j")));

        for _ in 0..5 {
            assert_eq!(controller.sync_log(JobId(7)).await.unwrap(), 0);
        }
        assert_eq!(controller.log_cursor(), 0);
        assert!(controller.into_output().is_empty());
        assert!(transport
            .commands()
            .iter()
            .all(|c| c == "dd if=/w/slurm-7.out bs=1 skip=0"));
    }

    #[tokio::test]
    async fn test_log_sync_advances_by_reported_count() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let log = Arc::new(Mutex::new(String::from("hello\n")));
        let remote = log.clone();
        transport.respond(move |command| {
            let skip: usize = command.rsplit("skip=").next().unwrap().parse().unwrap();
            let log = remote.lock().unwrap();
            let new = &log[skip.min(log.len())..];
            Ok(output(new, &dd_trailer(new.len()), 0))
        });
        let mut controller = controller(&transport, JobIdFile::new(dir.path().join("j")));

        assert_eq!(controller.sync_log(JobId(7)).await.unwrap(), 6);
        log.lock().unwrap().push_str("world\n");
        assert_eq!(controller.sync_log(JobId(7)).await.unwrap(), 6);
        assert_eq!(controller.sync_log(JobId(7)).await.unwrap(), 0);
        assert_eq!(controller.log_cursor(), 12);
        assert_eq!(controller.into_output(), b"hello\nworld\n");
    }

    #[tokio::test]
    async fn test_missing_log_counts_as_no_progress() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(|_| {
            Ok(output(
                "",
                "dd: failed to open '/w/slurm-7.out': No such file or directory\n",
                1,
            ))
        });
        let mut controller = controller(&transport, JobIdFile::new(dir.path().join("j")));
        assert_eq!(controller.sync_log(JobId(7)).await.unwrap(), 0);
        assert_eq!(controller.log_cursor(), 0);
    }

    #[tokio::test]
    async fn test_malformed_dd_trailer_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(|_| Ok(output("x", "weird\n", 0)));
        let mut controller = controller(&transport, JobIdFile::new(dir.path().join("j")));
        assert!(matches!(
            controller.sync_log(JobId(7)).await,
            Err(SlurmSshError::MalformedRemoteOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_status_failures_read_as_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(|_| Ok(output("", "slurm_load_jobs error: timeout\n", 1)));
        let mut controller = controller(&transport, JobIdFile::new(dir.path().join("j")));
        let info = controller.poll_status(JobId(7)).await.unwrap();
        assert_eq!(info, JobInfo::unknown());

        transport.fail_dials(1);
        transport.close_links();
        let info = controller.poll_status(JobId(7)).await.unwrap();
        assert_eq!(info, JobInfo::unknown());

        transport.respond(|_| Err(TransportError::Transient("eof".to_string())));
        let info = controller.poll_status(JobId(7)).await.unwrap();
        assert_eq!(info, JobInfo::unknown());
    }

    #[tokio::test]
    async fn test_refused_login_while_polling_keeps_following() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(|command| {
            if command.starts_with("scontrol") {
                Ok(output("JobState=RUNNING ExitCode=0:0\n", "", 0))
            } else {
                Ok(output("", &dd_trailer(0), 0))
            }
        });
        let mut controller = controller(&transport, JobIdFile::new(dir.path().join("j")));
        assert_eq!(controller.tick(JobId(7)).await.unwrap(), None);
        assert_eq!(transport.dials(), 1);

        transport.close_links();
        transport.reject_all();
        assert_eq!(
            controller.poll_status(JobId(7)).await.unwrap(),
            JobInfo::unknown()
        );
        assert_eq!(controller.sync_log(JobId(7)).await.unwrap(), 0);
        assert_eq!(controller.tick(JobId(7)).await.unwrap(), None);
        assert_eq!(controller.info(), &JobInfo::unknown());
        assert_eq!(controller.log_cursor(), 0);
    }

    #[tokio::test]
    async fn test_status_without_exit_code_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(|_| Ok(output("JobId=7 JobState=RUNNING\n", "", 0)));
        let mut controller = controller(&transport, JobIdFile::new(dir.path().join("j")));
        assert!(matches!(
            controller.poll_status(JobId(7)).await,
            Err(SlurmSshError::MalformedRemoteOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_submission_rejected_by_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.respond(|_| {
            Ok(output(
                "",
                "sbatch: error: Batch job submission failed: Invalid account\n",
                1,
            ))
        });
        let token = dir.path().join("j");
        let mut controller = controller(&transport, JobIdFile::new(&token));
        assert!(matches!(
            controller.acquire_job_id().await,
            Err(SlurmSshError::SubmitFailed {
                status: Some(1),
                ..
            })
        ));
        assert!(!token.exists());
    }

    #[tokio::test]
    async fn test_submission_retries_through_outage() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.fail_dials(20);
        transport.respond(|_| Ok(output("Submitted batch job 9\n", "", 0)));
        let token = dir.path().join("j");
        let mut controller = controller(&transport, JobIdFile::new(&token));
        assert_eq!(controller.acquire_job_id().await.unwrap(), JobId(9));
        assert_eq!(std::fs::read_to_string(&token).unwrap(), "9");
        assert_eq!(controller.into_output(), b"Submitted batch job 9\n");
    }
}
