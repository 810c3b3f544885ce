/// Test Evaluator - Line-Based Grading
///
/// **Core Responsibility:**
/// Compare the program's output against the expected output, one test case
/// per line.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about the sandbox file layout
/// - Pure function: (input, expected, actual) → pass or `TestsFailed`
///
/// **Normalization Rules (Applied to Every Line):**
/// - Trim leading and trailing whitespace: YES
/// - Ignore \r\n vs \n: YES (via trim)
/// - Case sensitivity: YES (exact match required)
/// - Line count must match exactly: YES

use crate::error::{EngineError, Result};
use std::fmt;

pub const INCOMPLETE_OUTPUT: &str = "Did not receive all test cases";

/// One test case whose output did not match
#[derive(Debug, Clone, PartialEq)]
pub struct LineMismatch {
    /// 0-based line index
    pub index: usize,
    pub input: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for LineMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Test {}: Input: {}, Expected: {} but got: {}",
            self.index, self.input, self.expected, self.actual
        )
    }
}

fn normalize_line(line: &str) -> &str {
    line.trim()
}

/// Collect every mismatching line.
///
/// Returns `None` when the line counts differ, since per-line results are
/// meaningless then. Input lines are optional; a missing one is reported as
/// empty.
pub fn find_mismatches(input: &str, expected: &str, actual: &str) -> Option<Vec<LineMismatch>> {
    let input_lines: Vec<&str> = input.lines().collect();
    let expected_lines: Vec<&str> = expected.lines().collect();
    let actual_lines: Vec<&str> = actual.lines().collect();

    if expected_lines.len() != actual_lines.len() {
        return None;
    }

    let mismatches = expected_lines
        .iter()
        .zip(&actual_lines)
        .enumerate()
        .filter_map(|(index, (expected, actual))| {
            let expected = normalize_line(expected);
            let actual = normalize_line(actual);
            (expected != actual).then(|| LineMismatch {
                index,
                input: input_lines
                    .get(index)
                    .map(|line| normalize_line(line))
                    .unwrap_or_default()
                    .to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        })
        .collect();

    Some(mismatches)
}

/// Grade a full run. Fails with `TestsFailed` carrying a report for the user.
pub fn grade(input: &str, expected: &str, actual: &str) -> Result<()> {
    match find_mismatches(input, expected, actual) {
        None => {
            tracing::debug!(
                expected_lines = expected.lines().count(),
                actual_lines = actual.lines().count(),
                "Line count mismatch"
            );
            Err(EngineError::TestsFailed(INCOMPLETE_OUTPUT.to_string()))
        }
        Some(mismatches) if mismatches.is_empty() => Ok(()),
        Some(mismatches) => {
            let report = mismatches
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n");
            Err(EngineError::TestsFailed(format!("Tests failed:\n{}", report)))
        }
    }
}
