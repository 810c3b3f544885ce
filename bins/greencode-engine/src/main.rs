mod config;
mod context;
mod engine;
mod error;
mod evaluator;
mod executor;
mod gather;
mod handlers;
mod parsers;
mod prepare;
mod scheduler;
mod settings;
mod upstream;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use bollard::Docker;
use config::LanguageRegistry;
use engine::{ContainerBackend, DockerEngine};
use executor::Executor;
use handlers::AppState;
use prepare::Preparer;
use scheduler::Scheduler;
use settings::EngineSettings;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use upstream::DbClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Green Code engine booting...");

    let settings = EngineSettings::from_env().context("Invalid engine settings")?;

    let registry = LanguageRegistry::load_or_builtin(&settings.languages_path).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;
    info!(languages = ?registry.list_languages(), "Loaded language profiles");

    let host_cpus = settings::host_cpu_count();
    if settings.cpu_count > host_cpus {
        warn!(
            cpu_count = settings.cpu_count,
            host_cpus,
            "More CPU slots than host CPUs; runs on missing CPUs will fail"
        );
    }

    let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
    let tmp_base = std::path::absolute(&settings.tmp_base)
        .with_context(|| format!("Invalid tmp base {}", settings.tmp_base.display()))?;
    let mut docker_engine = DockerEngine::new(docker, settings.limits, host_cpus)
        .with_sandbox_user(settings.sandbox_user);
    if let Some(host_tmp_base) = &settings.host_tmp_base {
        docker_engine = docker_engine.with_mount_map(tmp_base.clone(), host_tmp_base.clone());
    }
    let backend: Arc<dyn ContainerBackend> = Arc::new(docker_engine.clone());

    warm_up_images(backend.as_ref(), &registry).await;

    let db = Arc::new(DbClient::new(settings.db_url.clone(), settings.http_timeout)?);
    let preparer = Preparer::new(
        backend.clone(),
        db.clone(),
        tmp_base.clone(),
        settings.framework_root.clone(),
    );
    let scheduler = Scheduler::new(settings.cpu_count);
    let executor = Executor::new(Arc::new(registry), Arc::new(preparer), scheduler, backend, db);

    info!(
        cpu_slots = settings.cpu_count,
        memory_mb = settings.limits.memory_mb,
        time_limit_s = settings.limits.time_limit.as_secs(),
        sandbox_user = %settings.sandbox_user,
        tmp_base = %tmp_base.display(),
        db_url = %settings.db_url,
        "Engine configured"
    );

    let tracker = TaskTracker::new();
    let state = Arc::new(AppState {
        executor,
        tracker: tracker.clone(),
    });
    let app = handlers::routes(state);

    let addr = settings.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Setup graceful shutdown: drain submissions that are already running
    tracker.close();
    info!(in_flight = tracker.len(), "Draining in-flight submissions");
    if tokio::time::timeout(settings.shutdown_grace, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            in_flight = tracker.len(),
            "Shutdown grace period elapsed with submissions still running"
        );
    }

    // Abandoned runs cannot clean up after the runtime stops
    match docker_engine.remove_leftover_containers().await {
        Ok(0) => {}
        Ok(removed) => warn!(removed, "Removed leftover sandbox containers"),
        Err(e) => error!(error = %e, "Failed to remove leftover sandbox containers"),
    }

    info!("Engine shutdown complete");
    Ok(())
}

/// Make every registered image available before accepting work.
/// Failures are logged; the image is retried on first use.
async fn warm_up_images(backend: &dyn ContainerBackend, registry: &LanguageRegistry) {
    for profile in registry.profiles() {
        match backend.ensure_image(profile).await {
            Ok(()) => info!(language = %profile.name, image = %profile.image, "Image ready"),
            Err(e) => warn!(
                language = %profile.name,
                image = %profile.image,
                error = %e,
                "Image warm-up failed"
            ),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Received shutdown signal, draining in-flight submissions...");
}
