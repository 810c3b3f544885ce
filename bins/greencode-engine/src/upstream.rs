// Calls the engine makes to the database service
use crate::error::Result;
use async_trait::async_trait;
use greencode_common::endpoints;
use greencode_common::types::{SubmissionRequest, SubmissionResult};
use std::time::Duration;
use tracing::debug;

/// Source of the per-problem framework and wrapper bundle (a tar stream)
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn fetch_bundle(&self, submission: &SubmissionRequest) -> Result<Vec<u8>>;
}

/// Destination of final verdicts. Delivery is at-most-once.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn report(&self, verdict: &SubmissionResult) -> Result<()>;
}

/// HTTP client for the database service
#[derive(Clone)]
pub struct DbClient {
    http: reqwest::Client,
    base_url: String,
}

impl DbClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl BundleSource for DbClient {
    async fn fetch_bundle(&self, submission: &SubmissionRequest) -> Result<Vec<u8>> {
        let url = endpoints::framework_url(&self.base_url);
        let response = self
            .http
            .post(&url)
            .json(submission)
            .send()
            .await?
            .error_for_status()?;

        let bytes = response.bytes().await?;
        debug!(
            submission_id = %submission.submission_uuid,
            problem_id = submission.problem_id,
            bytes = bytes.len(),
            "Fetched framework bundle"
        );
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ResultSink for DbClient {
    async fn report(&self, verdict: &SubmissionResult) -> Result<()> {
        let url = endpoints::submission_result_url(&self.base_url);
        self.http
            .post(&url)
            .json(verdict)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
