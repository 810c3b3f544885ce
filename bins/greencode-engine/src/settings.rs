// Process-wide settings for the execution engine, read once from the environment
use anyhow::{bail, Context, Result};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Hard limits applied to every sandbox container
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxLimits {
    pub memory_mb: u64,
    pub time_limit: Duration,
    pub max_nproc: i64,
    /// Largest file the sandbox may create, in bytes
    pub max_fsize: i64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            time_limit: Duration::from_secs(30),
            max_nproc: 100,
            max_fsize: 1_024_000,
        }
    }
}

/// uid:gid a sandbox runs as when the engine itself runs as root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxUser {
    pub uid: u32,
    pub gid: u32,
}

impl SandboxUser {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

impl Default for SandboxUser {
    /// nobody:nogroup
    fn default() -> Self {
        Self {
            uid: 65534,
            gid: 65534,
        }
    }
}

impl std::fmt::Display for SandboxUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub host: String,
    pub port: u16,
    /// Base URL of the database service
    pub db_url: String,
    pub languages_path: PathBuf,
    /// Sandbox directories are created below this path
    pub tmp_base: PathBuf,
    /// Same directory as seen by the Docker daemon, when the engine itself
    /// runs inside a container
    pub host_tmp_base: Option<PathBuf>,
    /// Local copy of the per-language framework sources, if any
    pub framework_root: Option<PathBuf>,
    pub limits: SandboxLimits,
    pub sandbox_user: SandboxUser,
    pub cpu_count: usize,
    pub http_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl EngineSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = SandboxLimits::default();

        let limits = SandboxLimits {
            memory_mb: parse_or(&lookup, "GREENCODE_MEM_LIMIT_MB", defaults.memory_mb)?,
            time_limit: Duration::from_secs(parse_or(
                &lookup,
                "GREENCODE_TIME_LIMIT_SEC",
                defaults.time_limit.as_secs(),
            )?),
            max_nproc: parse_or(&lookup, "GREENCODE_MAX_NPROC", defaults.max_nproc)?,
            max_fsize: parse_or(&lookup, "GREENCODE_MAX_FSIZE", defaults.max_fsize)?,
        };

        let default_user = SandboxUser::default();
        let sandbox_user = SandboxUser {
            uid: parse_or(&lookup, "GREENCODE_SANDBOX_UID", default_user.uid)?,
            gid: parse_or(&lookup, "GREENCODE_SANDBOX_GID", default_user.gid)?,
        };
        if sandbox_user.is_root() {
            bail!("GREENCODE_SANDBOX_UID must not be 0");
        }

        let cpu_count = parse_or(&lookup, "GREENCODE_CPU_COUNT", host_cpu_count())?;
        if cpu_count == 0 {
            bail!("GREENCODE_CPU_COUNT must be at least 1");
        }
        if limits.memory_mb == 0 || limits.time_limit.is_zero() {
            bail!("sandbox memory and time limits must be non-zero");
        }

        Ok(Self {
            host: lookup("GREENCODE_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&lookup, "GREENCODE_PORT", 8081)?,
            db_url: lookup("GREENCODE_DB_URL").unwrap_or_else(|| "http://127.0.0.1:8080".to_string()),
            languages_path: lookup("GREENCODE_LANGUAGES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/languages.json")),
            tmp_base: lookup("GREENCODE_TMP_BASE")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("greencode")),
            host_tmp_base: lookup("GREENCODE_HOST_TMP_BASE").map(PathBuf::from),
            framework_root: lookup("GREENCODE_FRAMEWORK_ROOT").map(PathBuf::from),
            limits,
            sandbox_user,
            cpu_count,
            http_timeout: Duration::from_secs(parse_or(&lookup, "GREENCODE_HTTP_TIMEOUT_SEC", 30)?),
            shutdown_grace: Duration::from_secs(parse_or(
                &lookup,
                "GREENCODE_SHUTDOWN_GRACE_SEC",
                60,
            )?),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Number of CPUs this process may schedule onto
pub fn host_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
