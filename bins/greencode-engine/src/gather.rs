/// Result Gatherer - Turns Sandbox Artifacts Into a Verdict Body
///
/// Reads the well-known files the sandbox leaves in its working directory,
/// classifies compile and runtime failures, grades the output and extracts
/// the performance figures. Read-only; the directory may be deleted as soon
/// as this returns.
///
/// Every file here was writable by the submission, so only regular files
/// are read. Symlinks, directories and special files are refused.

use crate::error::{EngineError, Result};
use crate::evaluator;
use crate::parsers::{self, EmissionsReport, TimingReport};
use greencode_common::types::RunMetrics;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::debug;

pub const FAILED_FILE: &str = "failed.txt";
pub const COMPILE_STDERR_FILE: &str = "compile_stderr.txt";
pub const RUN_STDOUT_FILE: &str = "run_stdout.txt";
pub const RUN_STDERR_FILE: &str = "run_stderr.txt";
pub const INPUT_FILE: &str = "input.txt";
pub const EXPECTED_OUTPUT_FILE: &str = "expected_output.txt";
pub const TIMING_FILE: &str = "timing.txt";
pub const EMISSIONS_FILE: &str = "emissions.csv";
/// Written by the engine, not the sandbox
pub const CONTAINER_LOG_FILE: &str = "container_logs.log";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatherReport {
    pub timing: TimingReport,
    pub emissions: EmissionsReport,
}

impl GatherReport {
    pub fn metrics(&self) -> RunMetrics {
        RunMetrics {
            runtime_ms: self.timing.user_time_s * 1000.0,
            mem_usage_mb: self.timing.max_rss_kb as f64 / 1000.0,
            energy_usage_kwh: self.emissions.energy_kwh,
            emissions_kg: self.emissions.emissions_kg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FailReason {
    Success,
    Compile,
    Runtime,
}

fn parse_fail_reason(raw: &str) -> Result<FailReason> {
    match raw.trim() {
        "success" => Ok(FailReason::Success),
        "compile" => Ok(FailReason::Compile),
        "runtime" => Ok(FailReason::Runtime),
        other => Err(EngineError::UnknownFailReason(other.to_string())),
    }
}

fn io_error(name: &str, e: io::Error) -> EngineError {
    EngineError::Io(io::Error::new(e.kind(), format!("{}: {}", name, e)))
}

fn read(dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    let untrusted = || EngineError::UntrustedArtifact(name.to_string());

    if !std::fs::symlink_metadata(&path)
        .map_err(|e| io_error(name, e))?
        .file_type()
        .is_file()
    {
        return Err(untrusted());
    }

    // The sandbox is gone by now; O_NOFOLLOW still closes the swap window
    let mut file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(&path)
        .map_err(|e| match e.raw_os_error() {
            Some(libc::ELOOP) => untrusted(),
            _ => io_error(name, e),
        })?;
    if !file.metadata().map_err(|e| io_error(name, e))?.is_file() {
        return Err(untrusted());
    }

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| io_error(name, e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Like [`read`], but a missing file reads as empty
fn read_optional(dir: &Path, name: &str) -> Result<String> {
    match read(dir, name) {
        Err(EngineError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        other => other,
    }
}

pub fn gather(dir: &Path) -> Result<GatherReport> {
    match parse_fail_reason(&read(dir, FAILED_FILE)?)? {
        FailReason::Success => {}
        FailReason::Compile => {
            return Err(EngineError::CompileFailed(read_optional(dir, COMPILE_STDERR_FILE)?));
        }
        FailReason::Runtime => {
            return Err(EngineError::RuntimeFailed(read_optional(dir, RUN_STDERR_FILE)?));
        }
    }

    let input = read_optional(dir, INPUT_FILE)?;
    let expected = read(dir, EXPECTED_OUTPUT_FILE)?;
    let actual = read(dir, RUN_STDOUT_FILE)?;
    evaluator::grade(&input, &expected, &actual)?;

    let timing = parsers::parse_timing(&read(dir, TIMING_FILE)?)?;
    let emissions = parsers::parse_emissions(&read(dir, EMISSIONS_FILE)?)?;

    debug!(
        user_time_s = timing.user_time_s,
        max_rss_kb = timing.max_rss_kb,
        energy_kwh = emissions.energy_kwh,
        "Gathered sandbox results"
    );

    Ok(GatherReport { timing, emissions })
}
