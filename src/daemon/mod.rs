mod auth;
mod cleanup;
mod errors;
mod routes;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::executor::{CommandExecutor, JobExecutor, UnconfiguredExecutor};
use crate::queue::QueueManager;
use crate::worker::Worker;

pub use self::auth::HEADER_API_KEY;
pub use self::errors::ApiError;
pub use self::routes::{API_VERSION, STUCK_JOB_THRESHOLD, VERSION};

pub const HEALTH_PATH: &str = "/api/health";

/// Everything a request handler needs. Built once at startup and cloned into
/// every handler.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn QueueManager>,
    pub worker: Arc<Worker>,
    pub api_key: Arc<str>,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/execute", post(routes::execute))
        .route("/jobs", get(routes::list_jobs))
        .route(
            "/jobs/{id}",
            get(routes::get_job).delete(routes::cancel_job),
        )
        .route("/stats", get(routes::stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(routes::health))
        .route("/version", get(routes::version));

    Router::new()
        .nest("/api", protected.merge(public))
        .fallback(errors::not_found)
        .layer(CatchPanicLayer::custom(
            |panic: Box<dyn std::any::Any + Send + 'static>| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".into());
                tracing::error!(panic = %message, "request handler panicked");
                ApiError::internal().into_response()
            },
        ))
        .with_state(state)
}

fn with_tracing(app: Router, http_access: bool) -> Router {
    app.layer(
        TraceLayer::new_for_http()
            .make_span_with(move |req: &axum::http::Request<_>| {
                if !http_access && req.uri().path() == HEALTH_PATH {
                    return tracing::Span::none();
                }
                tracing::info_span!("request", method = %req.method(), path = %req.uri().path())
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                    if span.is_disabled() {
                        return;
                    }
                    tracing::info!(status = %res.status().as_u16(), latency_ms = latency.as_millis(), "response");
                },
            ),
    )
}

fn build_executor(config: &Config) -> Arc<dyn JobExecutor> {
    match &config.executor {
        Some(executor) => {
            tracing::info!(command = %executor.command, "using executor command");
            Arc::new(CommandExecutor::new(
                executor.command.clone(),
                executor.args.clone(),
            ))
        }
        None => {
            tracing::warn!("no executor command configured; jobs will fail until executor.command is set");
            Arc::new(UnconfiguredExecutor)
        }
    }
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let api_key: Arc<str> = Arc::from(config.server_api_key()?);
    let retention = config.cleanup_after()?;

    tracing::info!(
        config = %crate::paths::config_path()?.display(),
        data = %crate::paths::data_dir()?.display(),
        "starting server"
    );
    crate::paths::ensure_dirs()?;

    let backend = config.backend()?;
    let queue = tokio::task::spawn_blocking(move || crate::queue::open(&backend)).await??;

    let worker = Arc::new(Worker::new(
        queue.clone(),
        build_executor(&config),
        config.poll_interval(),
    ));
    worker.start()?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The first signal drains gracefully; a second one exits immediately.
    tokio::spawn(async move {
        wait_for_signal(&mut sigint, &mut sigterm).await;
        let _ = shutdown_tx.send(true);
        wait_for_signal(&mut sigint, &mut sigterm).await;
        tracing::warn!("received second signal, forcing shutdown");
        std::process::exit(1);
    });

    let cleanup_handle = retention
        .map(|retention| tokio::spawn(cleanup::run(queue.clone(), retention, shutdown_rx.clone())));

    let state = AppState {
        queue: queue.clone(),
        worker: worker.clone(),
        api_key,
    };
    let app = with_tracing(router(state), config.logging.http_access);

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
            tracing::info!("shutting down http server");
        })
        .await?;

    if let Some(handle) = cleanup_handle {
        let _ = handle.await;
    }

    tracing::info!("stopping worker");
    let stop_timeout = config.stop_timeout();
    let stopping = worker.clone();
    tokio::task::spawn_blocking(move || stopping.stop(stop_timeout)).await?;

    queue.close();
    tracing::info!("server shut down");

    Ok(())
}

async fn wait_for_signal(sigint: &mut Signal, sigterm: &mut Signal) {
    tokio::select! {
        _ = sigint.recv() => { tracing::debug!("received SIGINT"); }
        _ = sigterm.recv() => { tracing::debug!("received SIGTERM"); }
    }
}
