//! Failure taxonomy shared by every stage of an execution.

use greencode_common::types::{ErrorReason, Language};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("compilation failed")]
    CompileFailed(String),

    #[error("runtime error")]
    RuntimeFailed(String),

    #[error("tests failed")]
    TestsFailed(String),

    #[error("time limit exceeded")]
    Timeout,

    #[error("memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("cpu {0} does not exist on this host")]
    CpuOutOfRange(usize),

    #[error("no sandbox profile registered for language '{0}'")]
    UnsupportedLanguage(Language),

    #[error("failed to parse {file}: {message}")]
    Parse { file: &'static str, message: String },

    #[error("unknown fail reason {0:?}")]
    UnknownFailReason(String),

    /// A sandbox output that is not a regular file, such as a planted symlink
    #[error("sandbox output {0} is not a regular file")]
    UntrustedArtifact(String),

    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::Internal(message.into())
    }

    pub fn parse(file: &'static str, message: impl Into<String>) -> Self {
        EngineError::Parse {
            file,
            message: message.into(),
        }
    }

    /// Reason code reported upstream for this failure
    pub fn reason(&self) -> ErrorReason {
        match self {
            EngineError::CompileFailed(_) => ErrorReason::CompileError,
            EngineError::RuntimeFailed(_) => ErrorReason::RuntimeError,
            EngineError::TestsFailed(_) => ErrorReason::TestsFailed,
            EngineError::Timeout => ErrorReason::Timeout,
            EngineError::MemoryLimitExceeded => ErrorReason::MemLimit,
            EngineError::UntrustedArtifact(_) => ErrorReason::Security,
            EngineError::CpuOutOfRange(_)
            | EngineError::UnsupportedLanguage(_)
            | EngineError::Parse { .. }
            | EngineError::UnknownFailReason(_)
            | EngineError::Docker(_)
            | EngineError::Http(_)
            | EngineError::Io(_)
            | EngineError::Internal(_) => ErrorReason::InternalError,
        }
    }

    /// Message that may be shown to the submitter.
    ///
    /// Only output produced by the submission itself leaves the engine;
    /// infrastructure diagnostics stay in the logs.
    pub fn user_message(&self) -> Option<String> {
        match self {
            EngineError::CompileFailed(msg)
            | EngineError::RuntimeFailed(msg)
            | EngineError::TestsFailed(msg) => Some(msg.clone()),
            _ => None,
        }
    }

    /// True when the failure is a legitimate verdict on the submission
    /// rather than a fault of the engine.
    pub fn is_submission_fault(&self) -> bool {
        !matches!(self.reason(), ErrorReason::InternalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            EngineError::CompileFailed("x".into()).reason(),
            ErrorReason::CompileError
        );
        assert_eq!(
            EngineError::RuntimeFailed("x".into()).reason(),
            ErrorReason::RuntimeError
        );
        assert_eq!(
            EngineError::TestsFailed("x".into()).reason(),
            ErrorReason::TestsFailed
        );
        assert_eq!(EngineError::Timeout.reason(), ErrorReason::Timeout);
        assert_eq!(EngineError::MemoryLimitExceeded.reason(), ErrorReason::MemLimit);
        assert_eq!(
            EngineError::UntrustedArtifact("failed.txt".into()).reason(),
            ErrorReason::Security
        );
        assert_eq!(EngineError::CpuOutOfRange(64).reason(), ErrorReason::InternalError);
        assert_eq!(
            EngineError::UnknownFailReason("what".into()).reason(),
            ErrorReason::InternalError
        );
        assert_eq!(
            EngineError::from(std::io::Error::other("disk")).reason(),
            ErrorReason::InternalError
        );
    }

    #[test]
    fn test_internal_details_are_not_forwarded() {
        let err = EngineError::internal("docker socket at /var/run/docker.sock refused");
        assert_eq!(err.user_message(), None);
        assert!(!err.is_submission_fault());

        let err = EngineError::parse("timing.txt", "missing user time");
        assert_eq!(err.user_message(), None);

        let err = EngineError::UntrustedArtifact("run_stderr.txt".into());
        assert_eq!(err.user_message(), None);
        assert!(err.is_submission_fault());
    }

    #[test]
    fn test_submission_output_is_forwarded() {
        let err = EngineError::CompileFailed("main.c:3: error: expected ';'".into());
        assert_eq!(
            err.user_message().as_deref(),
            Some("main.c:3: error: expected ';'")
        );
        assert!(err.is_submission_fault());
        assert!(EngineError::Timeout.is_submission_fault());
    }
}
