//! Parsers for the measurement files produced inside the sandbox.

use crate::error::{EngineError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// The sandbox runs the submission this many times per measurement
pub const REPETITIONS: f64 = 1000.0;

const TIMING_FILE: &str = "timing report";
const EMISSIONS_FILE: &str = "emissions report";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingReport {
    pub user_time_s: f64,
    pub max_rss_kb: u64,
}

/// Per-run energy figures, already divided by [`REPETITIONS`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmissionsReport {
    pub duration_s: f64,
    pub emissions_kg: f64,
    pub energy_kwh: f64,
}

fn user_time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"User time \(seconds\):\s*(\d+(?:\.\d+)?)").expect("user time pattern")
    })
}

fn max_rss_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Maximum resident set size \(kbytes\):\s*(\d+)").expect("max rss pattern")
    })
}

fn last_capture<'a>(pattern: &Regex, text: &'a str) -> Option<&'a str> {
    pattern
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Parse the verbose report of GNU `time -v`.
///
/// When a field occurs more than once the last occurrence wins.
pub fn parse_timing(report: &str) -> Result<TimingReport> {
    let user_time = last_capture(user_time_pattern(), report)
        .ok_or_else(|| EngineError::parse(TIMING_FILE, "missing \"User time (seconds)\""))?;
    let max_rss = last_capture(max_rss_pattern(), report).ok_or_else(|| {
        EngineError::parse(TIMING_FILE, "missing \"Maximum resident set size (kbytes)\"")
    })?;

    Ok(TimingReport {
        user_time_s: user_time
            .parse()
            .map_err(|e| EngineError::parse(TIMING_FILE, format!("user time {:?}: {}", user_time, e)))?,
        max_rss_kb: max_rss
            .parse()
            .map_err(|e| EngineError::parse(TIMING_FILE, format!("max rss {:?}: {}", max_rss, e)))?,
    })
}

fn split_row(line: &str) -> Vec<&str> {
    line.split(',')
        .map(|field| field.trim().trim_matches('"'))
        .collect()
}

fn column(header: &[&str], name: &str) -> Result<usize> {
    header
        .iter()
        .position(|h| *h == name)
        .ok_or_else(|| EngineError::parse(EMISSIONS_FILE, format!("missing column {:?}", name)))
}

fn field(row: &[&str], index: usize, name: &str) -> Result<f64> {
    let raw = row
        .get(index)
        .ok_or_else(|| EngineError::parse(EMISSIONS_FILE, format!("row has no {:?} value", name)))?;
    raw.parse::<f64>()
        .map_err(|e| EngineError::parse(EMISSIONS_FILE, format!("{} {:?}: {}", name, raw, e)))
}

/// Parse the codecarbon CSV written by the sandbox.
///
/// Columns are located by header name; the last data row is used.
pub fn parse_emissions(csv: &str) -> Result<EmissionsReport> {
    let mut lines = csv.lines().filter(|line| !line.trim().is_empty());

    let header = lines
        .next()
        .map(split_row)
        .ok_or_else(|| EngineError::parse(EMISSIONS_FILE, "empty file"))?;
    let duration = column(&header, "duration")?;
    let emissions = column(&header, "emissions")?;
    let energy = column(&header, "energy_consumed")?;

    let row = lines
        .last()
        .map(split_row)
        .ok_or_else(|| EngineError::parse(EMISSIONS_FILE, "no data row"))?;

    Ok(EmissionsReport {
        duration_s: field(&row, duration, "duration")? / REPETITIONS,
        emissions_kg: field(&row, emissions, "emissions")? / REPETITIONS,
        energy_kwh: field(&row, energy, "energy_consumed")? / REPETITIONS,
    })
}
