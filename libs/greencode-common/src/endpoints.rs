//! HTTP endpoint paths shared by the engine and the CLI.

/// Database service: tarball with the framework and problem wrapper files
pub const FRAMEWORK_PATH: &str = "/api/framework";
/// Database service: stores the verdict of a finished submission
pub const SUBMISSION_RESULT_PATH: &str = "/api/write-submission-result";
/// Engine: accepts a submission for execution
pub const EXECUTE_PATH: &str = "/api/execute";
/// Engine: liveness and slot usage
pub const HEALTH_PATH: &str = "/api/health";

fn join(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

pub fn framework_url(db_base_url: &str) -> String {
    join(db_base_url, FRAMEWORK_PATH)
}

pub fn submission_result_url(db_base_url: &str) -> String {
    join(db_base_url, SUBMISSION_RESULT_PATH)
}

pub fn execute_url(engine_base_url: &str) -> String {
    join(engine_base_url, EXECUTE_PATH)
}

pub fn health_url(engine_base_url: &str) -> String {
    join(engine_base_url, HEALTH_PATH)
}
