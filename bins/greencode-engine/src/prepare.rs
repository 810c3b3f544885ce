/// Environment Preparer - Populates a Sandbox Directory
///
/// Builds the host directory a sandbox container will see at `/app`:
/// language framework files, the problem's wrapper bundle, the submission
/// source and an executable entry script. The returned [`SandboxDir`] owns
/// the directory from the moment it exists, so a failure at any later step
/// leaves nothing behind.

use crate::config::LanguageProfile;
use crate::context::{RunContext, SandboxDir};
use crate::engine::ContainerBackend;
use crate::error::{EngineError, Result};
use crate::upstream::BundleSource;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

pub const SANDBOX_PREFIX: &str = "execution_run_";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub struct Preparer {
    backend: Arc<dyn ContainerBackend>,
    bundles: Arc<dyn BundleSource>,
    tmp_base: PathBuf,
    framework_root: Option<PathBuf>,
}

impl Preparer {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        bundles: Arc<dyn BundleSource>,
        tmp_base: PathBuf,
        framework_root: Option<PathBuf>,
    ) -> Self {
        Self {
            backend,
            bundles,
            tmp_base,
            framework_root,
        }
    }

    #[instrument(skip(self, ctx), fields(submission_id = %ctx.submission_id(), language = %ctx.profile.name))]
    pub async fn prepare(&self, ctx: &mut RunContext) -> Result<SandboxDir> {
        self.backend.ensure_image(&ctx.profile).await?;

        let base = self.tmp_base.clone();
        let sandbox = blocking(move || Ok(SandboxDir::create_in(&base, SANDBOX_PREFIX)?)).await?;
        debug!(dir = %sandbox.path().display(), "Sandbox directory created");

        let bundle = self.bundles.fetch_bundle(&ctx.submission).await?;

        let dir = sandbox.path().to_path_buf();
        let profile = ctx.profile.clone();
        let submission = ctx.submission.clone();
        let framework_root = self.framework_root.clone();
        blocking(move || {
            populate(
                &dir,
                &profile,
                framework_root.as_deref(),
                &bundle,
                &submission.code,
            )
        })
        .await?;

        ctx.sandbox_dir = Some(sandbox.path().to_path_buf());
        Ok(sandbox)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::internal(format!("blocking task failed: {}", e)))?
}

fn with_name(name: &Path, e: io::Error) -> EngineError {
    EngineError::Io(io::Error::new(e.kind(), format!("{}: {}", name.display(), e)))
}

fn populate(
    dir: &Path,
    profile: &LanguageProfile,
    framework_root: Option<&Path>,
    bundle: &[u8],
    code: &str,
) -> Result<()> {
    if let Some(root) = framework_root {
        copy_framework_files(&root.join(profile.name.as_str()), dir, &profile.framework_files)?;
    }

    let extracted = extract_bundle(bundle, dir)?;
    debug!(files = extracted, "Bundle extracted");

    let submission_path = dir.join(profile.submission_file());
    fs::write(&submission_path, code).map_err(|e| with_name(&submission_path, e))?;

    let entry = dir.join(&profile.entry_script);
    if entry.is_file() {
        make_executable(&entry).map_err(|e| with_name(&entry, e))?;
    }

    verify_layout(dir, profile)
}

fn copy_framework_files(source: &Path, dir: &Path, files: &[String]) -> Result<()> {
    for file in files {
        let from = source.join(file);
        fs::copy(&from, dir.join(file)).map_err(|e| with_name(&from, e))?;
    }
    Ok(())
}

/// Unpack a tar or tar.gz bundle into `dir`, returning the number of files.
/// Entries with absolute or `..` paths are rejected.
pub fn extract_bundle(bundle: &[u8], dir: &Path) -> Result<usize> {
    if bundle.starts_with(&GZIP_MAGIC) {
        unpack(tar::Archive::new(GzDecoder::new(bundle)), dir)
    } else {
        unpack(tar::Archive::new(bundle), dir)
    }
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, dir: &Path) -> Result<usize> {
    let mut files = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || !entry.unpack_in(dir)? {
            return Err(EngineError::internal(format!(
                "bundle entry escapes the sandbox: {}",
                path.display()
            )));
        }

        if entry.header().entry_type().is_file() {
            files += 1;
        }
    }
    Ok(files)
}

fn make_executable(path: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)
}

fn verify_layout(dir: &Path, profile: &LanguageProfile) -> Result<()> {
    let missing: Vec<&str> = profile
        .required_files()
        .filter(|file| !dir.join(file).is_file())
        .collect();

    if !missing.is_empty() {
        return Err(EngineError::internal(format!(
            "sandbox is missing required files: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}
