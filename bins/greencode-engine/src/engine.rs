/// Sandbox Runner - Docker Execution Backend
///
/// **Core Responsibility:**
/// Run one prepared sandbox directory inside a locked-down container pinned
/// to a single CPU, and report how the container ended.
///
/// **Critical Architectural Boundary:**
/// - Runner knows HOW to execute (Docker)
/// - Runner does NOT read the sandbox's output files
/// - Runner does NOT grade anything
/// - A non-zero exit from `run.sh` is still `Success` here; the gatherer
///   classifies it from `failed.txt`
///
/// **Container Rules:**
/// 1. Sandbox directory bind-mounted read-write at `/app`, nothing else
/// 2. Network disabled, all capabilities dropped, no-new-privileges
/// 3. Read-only root filesystem; `TMPDIR` points into `/app`
/// 4. Memory, pids, nproc and fsize limits
/// 5. Pinned to the scheduler-assigned CPU
/// 6. Runs as the uid:gid owning the sandbox directory, never as root
/// 7. Removed on every path, including cancellation

use crate::config::LanguageProfile;
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::gather::CONTAINER_LOG_FILE;
use crate::settings::{SandboxLimits, SandboxUser};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Mount point of the sandbox directory inside the container
pub const SANDBOX_MOUNT: &str = "/app";

/// 128 + SIGKILL, what the kernel OOM killer leaves behind
const OOM_EXIT_CODE: i64 = 137;

/// Container label carrying the submission id
pub const SUBMISSION_LABEL: &str = "greencode.submission";
/// Container label carrying the id of the engine process that created it
pub const ENGINE_LABEL: &str = "greencode.engine";

/// How a sandbox container ended
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    Success,
    Timeout,
    MemoryLimitExceeded,
    InternalError(String),
}

impl SandboxOutcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            SandboxOutcome::Success => Ok(()),
            SandboxOutcome::Timeout => Err(EngineError::Timeout),
            SandboxOutcome::MemoryLimitExceeded => Err(EngineError::MemoryLimitExceeded),
            SandboxOutcome::InternalError(cause) => Err(EngineError::Internal(cause)),
        }
    }
}

/// Seam between the orchestration and the container runtime
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Make the profile's image available locally. Idempotent.
    async fn ensure_image(&self, profile: &LanguageProfile) -> Result<()>;

    /// Run the sandbox prepared in `ctx` on the CPU assigned to `ctx`
    async fn run(&self, ctx: &RunContext) -> Result<SandboxOutcome>;
}

/// Fails before any container exists when `cpu` is not a host CPU
pub fn validate_cpu(cpu: usize, host_cpus: usize) -> Result<()> {
    if cpu >= host_cpus {
        return Err(EngineError::CpuOutOfRange(cpu));
    }
    Ok(())
}

/// User a sandbox owned by `owner` runs as. A root-owned directory means a
/// root engine, so the sandbox is handed to `fallback` instead.
fn resolve_sandbox_user(owner: SandboxUser, fallback: SandboxUser) -> Result<SandboxUser> {
    let user = if owner.is_root() { fallback } else { owner };
    if user.is_root() {
        return Err(EngineError::internal("refusing to run a sandbox as root"));
    }
    Ok(user)
}

/// chown `path` and everything below it without following symlinks
fn chown_tree(path: &Path, user: SandboxUser) -> io::Result<()> {
    std::os::unix::fs::lchown(path, Some(user.uid), Some(user.gid))?;
    if std::fs::symlink_metadata(path)?.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), user)?;
        }
    }
    Ok(())
}

/// Settle the sandbox directory's owner and return the container user
fn claim_sandbox(dir: &Path, fallback: SandboxUser) -> Result<SandboxUser> {
    let meta = std::fs::symlink_metadata(dir)?;
    let owner = SandboxUser {
        uid: meta.uid(),
        gid: meta.gid(),
    };
    let user = resolve_sandbox_user(owner, fallback)?;
    if user != owner {
        chown_tree(dir, user)?;
    }
    Ok(user)
}

/// Replace `path` with a new regular file holding `bytes`. Whatever the
/// sandbox left at `path` is unlinked, never written through.
fn write_fresh_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)?;
    file.write_all(bytes)
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if the run is cancelled
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
    armed: bool,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            armed: true,
        }
    }

    async fn remove(mut self) -> Result<()> {
        self.armed = false;
        self.docker
            .remove_container(&self.container_id, Some(force_remove()))
            .await?;
        Ok(())
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cannot be async in Drop; hand the removal to the runtime
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = docker
                        .remove_container(&container_id, Some(force_remove()))
                        .await
                    {
                        warn!(container_id = %container_id, error = %e, "Failed to clean up container");
                    }
                });
            }
            Err(_) => {
                warn!(container_id = %container_id, "No runtime to clean up container");
            }
        }
    }
}

fn force_remove() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        ..Default::default()
    }
}

/// Exit code of the container, or the Docker error that prevented learning it
async fn wait_for_exit(docker: Docker, container_id: String) -> Result<i64> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut stream = docker.wait_container(&container_id, Some(options));
    match stream.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        // bollard reports non-zero exits as an error carrying the code
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(e.into()),
        None => Err(EngineError::internal("container wait returned no status")),
    }
}

/// Tar a Docker build context directory
fn tar_build_context(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}

/// Docker-based sandbox runner
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    limits: SandboxLimits,
    sandbox_user: SandboxUser,
    host_cpus: usize,
    /// Value of [`ENGINE_LABEL`] on every container this engine creates
    instance: Uuid,
    /// (engine-side base, daemon-side base) for bind mount sources
    mount_map: Option<(PathBuf, PathBuf)>,
}

impl DockerEngine {
    pub fn new(docker: Docker, limits: SandboxLimits, host_cpus: usize) -> Self {
        Self {
            docker,
            limits,
            sandbox_user: SandboxUser::default(),
            host_cpus,
            instance: Uuid::new_v4(),
            mount_map: None,
        }
    }

    /// User for sandboxes whose directory is owned by root
    pub fn with_sandbox_user(mut self, user: SandboxUser) -> Self {
        self.sandbox_user = user;
        self
    }

    /// Rewrite bind mount sources below `local_base` to `daemon_base`.
    /// Needed when the engine itself runs in a container next to the daemon.
    pub fn with_mount_map(mut self, local_base: PathBuf, daemon_base: PathBuf) -> Self {
        self.mount_map = Some((local_base, daemon_base));
        self
    }

    fn daemon_path(&self, dir: &Path) -> PathBuf {
        match &self.mount_map {
            Some((local, daemon)) => match dir.strip_prefix(local) {
                Ok(rest) => daemon.join(rest),
                Err(_) => dir.to_path_buf(),
            },
            None => dir.to_path_buf(),
        }
    }

    fn host_config(&self, mount_source: &Path, cpu: usize) -> HostConfig {
        let memory = (self.limits.memory_mb * 1024 * 1024) as i64;
        let ulimit = |name: &str, value: i64| ResourcesUlimits {
            name: Some(name.to_string()),
            soft: Some(value),
            hard: Some(value),
        };

        HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                mount_source.display(),
                SANDBOX_MOUNT
            )]),
            memory: Some(memory),
            // No swap on top of the memory ceiling
            memory_swap: Some(memory),
            pids_limit: Some(self.limits.max_nproc),
            ulimits: Some(vec![
                ulimit("nproc", self.limits.max_nproc),
                ulimit("fsize", self.limits.max_fsize),
            ]),
            cpuset_cpus: Some(cpu.to_string()),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(true),
            ..Default::default()
        }
    }

    fn container_config(
        &self,
        ctx: &RunContext,
        dir: &Path,
        cpu: usize,
        user: SandboxUser,
    ) -> Config<String> {
        let profile = &ctx.profile;
        Config {
            image: Some(profile.image.clone()),
            user: Some(user.to_string()),
            entrypoint: Some(vec![format!("./{}", profile.entry_script)]),
            working_dir: Some(SANDBOX_MOUNT.to_string()),
            // The root filesystem is read-only; compilers spill into the mount
            env: Some(vec![format!("TMPDIR={}", SANDBOX_MOUNT)]),
            network_disabled: Some(true),
            labels: Some(HashMap::from([
                (SUBMISSION_LABEL.to_string(), ctx.submission_id().to_string()),
                (ENGINE_LABEL.to_string(), self.instance.to_string()),
            ])),
            host_config: Some(self.host_config(&self.daemon_path(dir), cpu)),
            ..Default::default()
        }
    }

    fn instance_filter(&self) -> HashMap<String, Vec<String>> {
        HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", ENGINE_LABEL, self.instance)],
        )])
    }

    /// Force-remove every container this engine created that still exists.
    /// Returns how many were removed.
    pub async fn remove_leftover_containers(&self) -> Result<usize> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: self.instance_filter(),
            ..Default::default()
        };

        let mut removed = 0;
        for container in self.docker.list_containers(Some(options)).await? {
            let Some(container_id) = container.id else {
                continue;
            };
            match self
                .docker
                .remove_container(&container_id, Some(force_remove()))
                .await
            {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(container_id = %container_id, error = %e, "Failed to remove leftover container")
                }
            }
        }
        Ok(removed)
    }

    /// Pull an image from its registry
    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result?;
        }
        Ok(())
    }

    /// Build an image from a local Dockerfile context
    async fn build_image(&self, image: &str, context_dir: &Path) -> Result<()> {
        let dir = context_dir.to_path_buf();
        let context = tokio::task::spawn_blocking(move || tar_build_context(&dir))
            .await
            .map_err(|e| EngineError::internal(format!("build context task failed: {}", e)))??;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(error) = info.error {
                return Err(EngineError::internal(format!(
                    "building image {} failed: {}",
                    image, error
                )));
            }
            if let Some(line) = info.stream {
                let line = line.trim();
                if !line.is_empty() {
                    debug!(image = %image, "{}", line);
                }
            }
        }
        Ok(())
    }

    /// Write the container's combined output next to the sandbox outputs.
    /// Best effort: failures are only logged.
    async fn save_logs(&self, container_id: &str, dir: &Path) {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });

        let mut logs = Vec::new();
        let mut stream = self.docker.logs(container_id, options);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => logs.extend_from_slice(&output.into_bytes()),
                Err(e) => {
                    warn!(container_id = %container_id, error = %e, "Error reading container logs");
                    break;
                }
            }
        }

        let path = dir.join(CONTAINER_LOG_FILE);
        let written = tokio::task::spawn_blocking(move || write_fresh_file(&path, &logs))
            .await
            .map_err(io::Error::other)
            .and_then(|result| result);
        if let Err(e) = written {
            warn!(container_id = %container_id, error = %e, "Failed to save container logs");
        }
    }

    /// Create, start and wait for the container. Docker errors propagate.
    async fn execute(&self, config: Config<String>, dir: &Path) -> Result<SandboxOutcome> {
        let name = format!("greencode-{}", Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await?;
        let container_id = container.id;

        // Set up the cleanup guard immediately after creation
        let guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;

        let waiter = tokio::spawn(wait_for_exit(self.docker.clone(), container_id.clone()));
        let waiter_abort = waiter.abort_handle();

        let exit_code = match tokio::time::timeout(self.limits.time_limit, waiter).await {
            Ok(joined) => Some(joined.map_err(|e| {
                EngineError::internal(format!("container wait task failed: {}", e))
            })??),
            Err(_) => {
                waiter_abort.abort();
                warn!(
                    container_id = %container_id,
                    time_limit_s = self.limits.time_limit.as_secs(),
                    "Sandbox timed out, killing container"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                }
                None
            }
        };

        self.save_logs(&container_id, dir).await;

        let outcome = match exit_code {
            None => SandboxOutcome::Timeout,
            Some(code) => {
                let oom_killed = self
                    .docker
                    .inspect_container(&container_id, None)
                    .await?
                    .state
                    .and_then(|state| state.oom_killed)
                    .unwrap_or(false);

                debug!(
                    container_id = %container_id,
                    exit_code = code,
                    oom_killed,
                    "Container exited"
                );

                if code == OOM_EXIT_CODE || oom_killed {
                    SandboxOutcome::MemoryLimitExceeded
                } else {
                    SandboxOutcome::Success
                }
            }
        };

        if let Err(e) = guard.remove().await {
            warn!(container_id = %container_id, error = %e, "Failed to remove container");
        }

        info!(
            container_id = %container_id,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "Sandbox finished"
        );

        Ok(outcome)
    }
}

#[async_trait]
impl ContainerBackend for DockerEngine {
    /// **Image Cache Health Check:**
    /// - Cache hit when the image inspects locally
    /// - Cache miss builds from the profile's Dockerfile context, or pulls
    #[instrument(skip(self, profile), fields(language = %profile.name, image = %profile.image))]
    async fn ensure_image(&self, profile: &LanguageProfile) -> Result<()> {
        if self.docker.inspect_image(&profile.image).await.is_ok() {
            debug!("Image cache hit");
            return Ok(());
        }

        match &profile.dockerfile_dir {
            Some(dir) => {
                warn!(context = %dir.display(), "Image cache miss, building");
                self.build_image(&profile.image, dir).await?;
                info!("Image built");
            }
            None => {
                warn!("Image cache miss, pulling");
                self.pull_image(&profile.image).await?;
                info!("Image pulled");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(submission_id = %ctx.submission_id(), cpu = ?ctx.cpu))]
    async fn run(&self, ctx: &RunContext) -> Result<SandboxOutcome> {
        let cpu = ctx.require_cpu()?;
        validate_cpu(cpu, self.host_cpus)?;
        let dir = ctx.require_sandbox_dir()?;

        let owned_dir = dir.to_path_buf();
        let fallback = self.sandbox_user;
        let user = tokio::task::spawn_blocking(move || claim_sandbox(&owned_dir, fallback))
            .await
            .map_err(|e| EngineError::internal(format!("sandbox ownership task failed: {}", e)))??;
        let config = self.container_config(ctx, dir, cpu, user);

        match self.execute(config, dir).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Ok(SandboxOutcome::InternalError(e.to_string())),
        }
    }
}
