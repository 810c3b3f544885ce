use crate::config::LanguageProfile;
use crate::error::{EngineError, Result};
use greencode_common::types::SubmissionRequest;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Working record of one execution, owned by a single executor invocation
#[derive(Debug)]
pub struct RunContext {
    pub submission: Arc<SubmissionRequest>,
    pub profile: Arc<LanguageProfile>,
    /// Assigned by the scheduler
    pub cpu: Option<usize>,
    /// Assigned by the preparer
    pub sandbox_dir: Option<PathBuf>,
}

impl RunContext {
    pub fn new(submission: Arc<SubmissionRequest>, profile: Arc<LanguageProfile>) -> Self {
        Self {
            submission,
            profile,
            cpu: None,
            sandbox_dir: None,
        }
    }

    pub fn submission_id(&self) -> Uuid {
        self.submission.submission_uuid
    }

    pub fn require_cpu(&self) -> Result<usize> {
        self.cpu
            .ok_or_else(|| EngineError::internal("run context has no cpu assigned"))
    }

    pub fn require_sandbox_dir(&self) -> Result<&Path> {
        self.sandbox_dir
            .as_deref()
            .ok_or_else(|| EngineError::internal("run context has no sandbox directory"))
    }
}

/// A sandbox directory on the host.
///
/// The directory is deleted when this value is dropped, which covers error
/// returns, panics and task cancellation. [`SandboxDir::remove`] deletes it
/// off the async runtime and reports failures.
#[derive(Debug)]
pub struct SandboxDir {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl SandboxDir {
    pub fn create_in(base: &Path, prefix: &str) -> io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(base)?;
        let path = std::path::absolute(dir.path())?;
        Ok(Self {
            path,
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(io::Error::other)?,
            None => Ok(()),
        }
    }
}
