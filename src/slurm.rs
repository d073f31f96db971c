//! Slurm text protocol.
//!
//! Builds the exact command lines sent to the login node and scrapes the
//! pieces we need out of `sbatch`, `scontrol show job` and `dd` output. All
//! the brittle string handling lives here.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Number of whitespace-separated fields in "Submitted batch job <id>".
const SUBMIT_FIELDS: usize = 4;
/// Position of the job id in the submission output.
const SUBMIT_ID_FIELD: usize = 3;

const JOB_STATE_MARKER: &str = "JobState=";
const EXIT_CODE_MARKER: &str = "ExitCode=";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected} fields in submission output, got {got}: {text:?}")]
    FieldCount {
        expected: usize,
        got: usize,
        text: String,
    },
    #[error("job id {0:?} is not a number")]
    JobId(String),
    #[error("no {0} in job status output")]
    MissingMarker(&'static str),
    #[error("exit code {0:?} is not of the form <code>:<signal>")]
    ExitCode(String),
    #[error("cannot read transferred byte count from {0:?}")]
    TransferCount(String),
}

/// Scheduler-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse()
            .map(JobId)
            .map_err(|_| ParseError::JobId(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Purged,
    Cancelled,
    Timeout,
    NodeFail,
    OutOfMemory,
    BootFail,
    Deadline,
    Preempted,
    /// The status query itself failed this tick.
    Unknown,
    /// Anything else the scheduler reports (COMPLETING, SUSPENDED, ...).
    Other(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        self.exit_code(0).is_some()
    }

    /// Local exit code for a job that ended in this state with `reported`
    /// as the scheduler's exit code, or `None` while the job is still live.
    pub fn exit_code(&self, reported: i32) -> Option<i32> {
        match self {
            JobState::Completed | JobState::Failed | JobState::Purged => Some(reported),
            JobState::Cancelled => Some(1),
            JobState::Timeout
            | JobState::NodeFail
            | JobState::OutOfMemory
            | JobState::BootFail
            | JobState::Deadline
            | JobState::Preempted => Some(if reported == 0 { 1 } else { reported }),
            JobState::Pending | JobState::Running | JobState::Unknown | JobState::Other(_) => None,
        }
    }
}

impl From<&str> for JobState {
    fn from(s: &str) -> Self {
        match s {
            "PENDING" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "COMPLETED" => JobState::Completed,
            "FAILED" => JobState::Failed,
            "PURGED" => JobState::Purged,
            "CANCELLED" => JobState::Cancelled,
            "TIMEOUT" => JobState::Timeout,
            "NODE_FAIL" => JobState::NodeFail,
            "OUT_OF_MEMORY" => JobState::OutOfMemory,
            "BOOT_FAIL" => JobState::BootFail,
            "DEADLINE" => JobState::Deadline,
            "PREEMPTED" => JobState::Preempted,
            "UNKNOWN" => JobState::Unknown,
            other => JobState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Purged => "PURGED",
            JobState::Cancelled => "CANCELLED",
            JobState::Timeout => "TIMEOUT",
            JobState::NodeFail => "NODE_FAIL",
            JobState::OutOfMemory => "OUT_OF_MEMORY",
            JobState::BootFail => "BOOT_FAIL",
            JobState::Deadline => "DEADLINE",
            JobState::Preempted => "PREEMPTED",
            JobState::Unknown => "UNKNOWN",
            JobState::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// Latest known status of the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub state: JobState,
    pub exit_code: i32,
}

impl Default for JobInfo {
    fn default() -> Self {
        Self {
            state: JobState::Pending,
            exit_code: 0,
        }
    }
}

impl JobInfo {
    pub fn unknown() -> Self {
        Self {
            state: JobState::Unknown,
            exit_code: 0,
        }
    }

    /// Process exit code once the job is over.
    pub fn final_exit_code(&self) -> Option<i32> {
        self.state.exit_code(self.exit_code)
    }
}

pub fn submit_command(workdir: &str, script: &str) -> String {
    format!("cd {workdir} && sbatch {script}")
}

pub fn status_command(id: JobId) -> String {
    format!("scontrol show job {id}")
}

pub fn log_path(workdir: &str, id: JobId) -> String {
    format!("{workdir}/slurm-{id}.out")
}

/// Raw byte read of the job log starting at `skip`.
pub fn log_command(workdir: &str, id: JobId, skip: u64) -> String {
    format!("dd if={} bs=1 skip={skip}", log_path(workdir, id))
}

/// Parse "Submitted batch job <id>".
pub fn parse_submission(text: &str) -> Result<JobId, ParseError> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != SUBMIT_FIELDS {
        return Err(ParseError::FieldCount {
            expected: SUBMIT_FIELDS,
            got: fields.len(),
            text: text.to_string(),
        });
    }
    fields[SUBMIT_ID_FIELD].parse()
}

/// Pull the state and exit code out of `scontrol show job` output.
pub fn parse_job_info(text: &str) -> Result<JobInfo, ParseError> {
    let state = marker_value(text, JOB_STATE_MARKER)
        .ok_or(ParseError::MissingMarker(JOB_STATE_MARKER))?;
    let exit = marker_value(text, EXIT_CODE_MARKER)
        .ok_or(ParseError::MissingMarker(EXIT_CODE_MARKER))?;
    let exit_code = exit
        .split_once(':')
        .and_then(|(code, _signal)| code.parse().ok())
        .ok_or_else(|| ParseError::ExitCode(exit.to_string()))?;
    Ok(JobInfo {
        state: JobState::from(state),
        exit_code,
    })
}

/// Value of the first whitespace-separated `key=value` token starting with
/// `marker`.
fn marker_value<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.split_whitespace()
        .find_map(|token| token.strip_prefix(marker))
}

/// Bytes transferred according to `dd`'s stderr trailer. The third line reads
/// "<n> bytes (...) copied, ...".
pub fn parse_transfer_count(stderr: &str) -> Result<u64, ParseError> {
    stderr
        .lines()
        .nth(2)
        .and_then(|line| line.split_whitespace().next())
        .and_then(|count| count.parse().ok())
        .ok_or_else(|| ParseError::TransferCount(stderr.to_string()))
}
