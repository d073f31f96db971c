//! Configuration for slurm-ssh.
//!
//! The command line only names a YAML file; everything else comes from that
//! file. The file is checked once up front and every missing or mistyped key
//! is reported together.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use thiserror::Error;

use crate::transport::{ConnectionTarget, Secret};

const DEFAULT_CONNECT_TIMEOUT: u64 = 30;
const DEFAULT_SUBMIT_RETRY_INTERVAL: u64 = 5;

#[derive(Parser)]
#[command(version, author, about)]
pub struct Cli {
    /// YAML file describing the remote host and the job to run
    pub config: PathBuf,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {} not found: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{}", .0.iter().join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Presence switches to password authentication.
    pub password: Option<Secret>,
    /// Local file remembering the submitted job's id.
    pub job_id_file: PathBuf,
    /// Remote working directory the script is submitted from.
    pub workdir: String,
    /// Batch script, relative to `workdir`.
    pub script_file: String,
    /// Poll period.
    pub interval: Duration,
    pub connect_timeout: Duration,
    pub submit_retry_interval: Duration,
    /// Where identity files are looked up. Defaults to `~/.ssh`.
    pub key_dir: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // An empty file is an empty mapping, so every required key is reported.
        let map = if text.trim().is_empty() {
            HashMap::new()
        } else {
            serde_yaml::from_str(text)?
        };
        let mut fields = Fields {
            map,
            problems: Vec::new(),
        };

        let host = fields.required::<String>("host");
        let port = fields.required::<u16>("port");
        let username = fields.required::<String>("username");
        let password = fields.optional::<String>("password");
        let job_id_file = fields.required::<PathBuf>("jobIdFile");
        let workdir = fields.required::<String>("workdir");
        let script_file = fields.required::<String>("scriptFile");
        let interval = fields.required::<u64>("interval");
        let connect_timeout = fields.optional::<u64>("connectTimeout");
        let submit_retry_interval = fields.optional::<u64>("submitRetryInterval");
        let key_dir = fields.optional::<PathBuf>("keyDir");

        match (host, port, username, job_id_file, workdir, script_file, interval) {
            (
                Some(host),
                Some(port),
                Some(username),
                Some(job_id_file),
                Some(workdir),
                Some(script_file),
                Some(interval),
            ) if fields.problems.is_empty() => Ok(Self {
                host,
                port,
                username,
                password: password.map(Secret::new),
                job_id_file,
                workdir,
                script_file,
                interval: Duration::from_secs(interval),
                connect_timeout: Duration::from_secs(
                    connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
                ),
                submit_retry_interval: Duration::from_secs(
                    submit_retry_interval.unwrap_or(DEFAULT_SUBMIT_RETRY_INTERVAL),
                ),
                key_dir,
            }),
            _ => Err(ConfigError::Invalid(fields.problems)),
        }
    }

    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Typed access to the raw mapping that records every problem it meets.
struct Fields {
    map: HashMap<String, Value>,
    problems: Vec<String>,
}

impl Fields {
    fn required<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        let value = self.optional(key);
        if value.is_none() && matches!(self.map.get(key), None | Some(Value::Null)) {
            self.problems.push(format!("'{}' not found", key));
        }
        value
    }

    fn optional<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        match self.map.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => match serde_yaml::from_value(value.clone()) {
                Ok(v) => Some(v),
                Err(e) => {
                    self.problems.push(format!("'{}' has the wrong type: {}", key, e));
                    None
                }
            },
        }
    }
}
