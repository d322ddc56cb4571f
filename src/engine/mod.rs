pub mod api;
pub mod artifact;
pub mod checker;
pub mod config;
pub mod error;
pub mod language;
pub mod limits;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod sandbox;
#[cfg(test)]
mod testing;
pub mod verdict;
pub mod worker;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    api::{ApiSettings, routes},
    checker::ExternalChecker,
    config::{JudgerConfig, LogFormat},
    language::LanguageRegistry,
    metrics::MetricsRegistry,
    pipeline::{JudgePipeline, PipelineSettings},
    queue::Scheduler,
    runner::TwoPassExecutor,
    sandbox::{DockerSandbox, SandboxController},
    worker::spawn_worker_pool,
};

pub async fn run() -> anyhow::Result<()> {
    let mut config = JudgerConfig::from_env();
    init_tracing(&config);
    config.prepare_dirs().context("failed to prepare judge directories")?;

    let languages = match &config.languages_path {
        Some(path) => LanguageRegistry::from_json_file(path)
            .with_context(|| format!("failed to load languages from {}", path.display()))?,
        None => LanguageRegistry::builtin(),
    };
    tracing::info!(languages = ?languages.names(), "language table loaded");

    let docker = DockerSandbox::connect(config.sandbox_image.clone(), config.docker_timeout)
        .context("failed to connect to docker")?;
    docker
        .ensure_image()
        .await
        .context("sandbox image is not available")?;
    let controller = SandboxController::new(Arc::new(docker));
    let backend_name = controller.backend().name();

    let executor = TwoPassExecutor::new(
        controller.clone(),
        config.limit_defaults,
        config.sandbox_workdir.clone(),
        config.sandbox_data_dir.clone(),
    );
    let pipeline = Arc::new(JudgePipeline::new(
        controller,
        Arc::new(executor),
        Arc::new(
            ExternalChecker::new(config.checker_dir.clone()).with_timeout(config.checker_timeout),
        ),
        Arc::new(languages),
        PipelineSettings {
            working_dir: config.sandbox_workdir.clone(),
            test_data_dir: config.test_data_dir.clone(),
            temp_dir: config.temp_dir.clone(),
            compile_file_size: config.compile_file_size,
            defaults: config.limit_defaults,
        },
    ));

    let metrics = Arc::new(MetricsRegistry::new());
    let scheduler = Scheduler::new(config.queue_capacity, metrics.clone());
    spawn_worker_pool(
        config.worker_count.max(1),
        scheduler.receiver(),
        pipeline,
        metrics.clone(),
    );

    let app: Router = routes(
        ApiSettings::from_config(&config, backend_name),
        scheduler,
        metrics,
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(
        bind = %local,
        workers = config.worker_count.max(1),
        image = %config.sandbox_image,
        test_data = %config.test_data_dir.display(),
        "judge server ready"
    );
    axum::serve(listener, app).await.context("judge server error")?;
    Ok(())
}

fn init_tracing(config: &JudgerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => builder.with_target(false).compact().init(),
    }
}
