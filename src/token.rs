use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::slurm::JobId;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// File holding the id of the submitted job across restarts.
///
/// Its presence means the job was already submitted.
pub struct JobIdFile {
    path: PathBuf,
}

impl JobIdFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded job id. A missing or unparsable file yields `None`.
    pub fn load(&self) -> Option<JobId> {
        let content = fs::read_to_string(&self.path).ok()?;
        content.trim().parse().ok()
    }

    /// Replace the file's content with `id` in one step.
    pub fn save(&self, id: JobId) -> Result<(), TokenError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, id.to_string())
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|source| TokenError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Forget the job. Removing a file that is already gone is fine.
    pub fn remove(&self) -> Result<(), TokenError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TokenError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
