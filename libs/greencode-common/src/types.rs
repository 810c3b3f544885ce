use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Python,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::C, Language::Python];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Python => "python",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "c" => Ok(Language::C),
            "python" => Ok(Language::Python),
            other => Err(format!("unsupported language: {}", other)),
        }
    }
}

/// A submission as handed to the execution engine by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub submission_uuid: Uuid,
    pub problem_id: i64,
    pub user_uuid: Uuid,
    pub language: Language,
    /// Unix seconds
    pub timestamp: i64,
    pub code: String,
}

impl SubmissionRequest {
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

/// Every reason an execution can fail, as stored by the database service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    TestsFailed,
    MemLimit,
    Timeout,
    Security,
    CompileError,
    RuntimeError,
    InternalError,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::TestsFailed => "tests_failed",
            ErrorReason::MemLimit => "mem_limit",
            ErrorReason::Timeout => "timeout",
            ErrorReason::Security => "security",
            ErrorReason::CompileError => "compile_error",
            ErrorReason::RuntimeError => "runtime_error",
            ErrorReason::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run performance figures of a successful execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub runtime_ms: f64,
    pub mem_usage_mb: f64,
    pub energy_usage_kwh: f64,
    pub emissions_kg: f64,
}

/// Final verdict for one submission, posted to the database service.
///
/// Only constructible through [`SubmissionResult::success`] and
/// [`SubmissionResult::failure`], so `successful` and `error_reason` can
/// never disagree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionResult {
    submission_uuid: Uuid,
    runtime_ms: f64,
    mem_usage_mb: f64,
    energy_usage_kwh: f64,
    emissions_kg: f64,
    successful: bool,
    error_reason: Option<ErrorReason>,
    error_msg: Option<String>,
}

impl SubmissionResult {
    pub fn success(submission_uuid: Uuid, metrics: RunMetrics) -> Self {
        Self {
            submission_uuid,
            runtime_ms: metrics.runtime_ms,
            mem_usage_mb: metrics.mem_usage_mb,
            energy_usage_kwh: metrics.energy_usage_kwh,
            emissions_kg: metrics.emissions_kg,
            successful: true,
            error_reason: None,
            error_msg: None,
        }
    }

    pub fn failure(submission_uuid: Uuid, reason: ErrorReason, error_msg: Option<String>) -> Self {
        Self {
            submission_uuid,
            runtime_ms: 0.0,
            mem_usage_mb: 0.0,
            energy_usage_kwh: 0.0,
            emissions_kg: 0.0,
            successful: false,
            error_reason: Some(reason),
            error_msg,
        }
    }

    pub fn submission_uuid(&self) -> Uuid {
        self.submission_uuid
    }

    pub fn successful(&self) -> bool {
        self.successful
    }

    pub fn error_reason(&self) -> Option<ErrorReason> {
        self.error_reason
    }

    pub fn error_msg(&self) -> Option<&str> {
        self.error_msg.as_deref()
    }

    pub fn metrics(&self) -> RunMetrics {
        RunMetrics {
            runtime_ms: self.runtime_ms,
            mem_usage_mb: self.mem_usage_mb,
            energy_usage_kwh: self.energy_usage_kwh,
            emissions_kg: self.emissions_kg,
        }
    }
}
