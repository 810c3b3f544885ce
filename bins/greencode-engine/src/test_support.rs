// Shared fixtures and trait doubles for unit tests
use crate::config::{LanguageProfile, LanguageRegistry};
use crate::context::RunContext;
use crate::engine::{ContainerBackend, SandboxOutcome};
use crate::error::{EngineError, Result};
use crate::upstream::{BundleSource, ResultSink};
use async_trait::async_trait;
use greencode_common::types::{Language, SubmissionRequest, SubmissionResult};
use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub fn submission(language: Language, code: &str) -> SubmissionRequest {
    SubmissionRequest {
        submission_uuid: Uuid::new_v4(),
        problem_id: 1,
        user_uuid: Uuid::new_v4(),
        language,
        timestamp: 1_700_000_000,
        code: code.to_string(),
    }
}

pub fn context(language: Language) -> RunContext {
    let profile = LanguageRegistry::builtin()
        .resolve(language)
        .expect("builtin profile");
    RunContext::new(Arc::new(submission(language, "int main(void) { return 0; }")), profile)
}

/// Plain tar holding `files` as regular files
pub fn tar_bundle(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Bundle with every wrapper and extra file of `profile` plus the entry script
pub fn complete_bundle(profile: &LanguageProfile) -> Vec<u8> {
    let files: Vec<(&str, &str)> = profile
        .wrapper_files
        .iter()
        .chain(&profile.extra_files)
        .map(|f| (f.as_str(), "/* wrapper */\n"))
        .chain(std::iter::once((
            profile.entry_script.as_str(),
            "#!/bin/sh\necho success > failed.txt\n",
        )))
        .collect();
    tar_bundle(&files)
}

/// Writes the framework files of `profile` below `root/<language>/`
pub fn write_framework_root(root: &Path, profile: &LanguageProfile) {
    let dir = root.join(profile.name.as_str());
    std::fs::create_dir_all(&dir).unwrap();
    for file in &profile.framework_files {
        std::fs::write(dir.join(file), "/* framework */\n").unwrap();
    }
}

/// Serves one fixed bundle, or fails every fetch
pub struct StaticBundles {
    bundle: Option<Vec<u8>>,
    pub fetches: AtomicUsize,
}

impl StaticBundles {
    pub fn new(bundle: Vec<u8>) -> Self {
        Self {
            bundle: Some(bundle),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            bundle: None,
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BundleSource for StaticBundles {
    async fn fetch_bundle(&self, _submission: &SubmissionRequest) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.bundle
            .clone()
            .ok_or_else(|| EngineError::internal("database service unavailable"))
    }
}

/// Records every verdict it is given
#[derive(Default)]
pub struct RecordingSink {
    verdicts: Mutex<Vec<SubmissionResult>>,
    fail: bool,
}

impl RecordingSink {
    /// Records, then reports a delivery failure
    pub fn failing() -> Self {
        Self {
            verdicts: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn verdicts(&self) -> Vec<SubmissionResult> {
        self.verdicts.lock().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn report(&self, verdict: &SubmissionResult) -> Result<()> {
        self.verdicts.lock().push(verdict.clone());
        if self.fail {
            return Err(EngineError::internal("result endpoint returned 503"));
        }
        Ok(())
    }
}

type RunFn = dyn Fn(&Path) -> Result<SandboxOutcome> + Send + Sync;

/// Container backend that runs a closure against the sandbox directory
pub struct FakeBackend {
    image_error: bool,
    on_run: Box<RunFn>,
    pub images_ensured: AtomicUsize,
    /// CPU of every run, in order
    pub cpus: Mutex<Vec<usize>>,
}

impl FakeBackend {
    pub fn new(on_run: impl Fn(&Path) -> Result<SandboxOutcome> + Send + Sync + 'static) -> Self {
        Self {
            image_error: false,
            on_run: Box::new(on_run),
            images_ensured: AtomicUsize::new(0),
            cpus: Mutex::new(Vec::new()),
        }
    }

    /// Fails `ensure_image`; `run` is never expected
    pub fn missing_image() -> Self {
        Self {
            image_error: true,
            ..Self::new(|_| panic!("run without an image"))
        }
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn ensure_image(&self, profile: &LanguageProfile) -> Result<()> {
        self.images_ensured.fetch_add(1, Ordering::SeqCst);
        if self.image_error {
            return Err(EngineError::internal(format!("no such image: {}", profile.image)));
        }
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> Result<SandboxOutcome> {
        let cpu = ctx.require_cpu()?;
        let dir = ctx.require_sandbox_dir()?;
        self.cpus.lock().push(cpu);
        (self.on_run)(dir)
    }
}

/// Entries directly below `dir`
pub fn dir_entries(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}
