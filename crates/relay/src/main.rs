mod auth;
mod config;
mod db;
mod error;
mod metrics;
mod permissions;
mod protocol;
mod storage;
mod sync;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::{gate::AccessGate, jwt::JwtAccessTokenService};
use crate::config::{LogFormat, RelayConfig};
use crate::db::{
    migrations::run_migrations,
    pool::{check_pool_health, create_pg_pool, PoolConfig},
};
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode, RelayError,
};
use crate::metrics::RelayMetrics;
use crate::permissions::PermissionResolver;
use crate::storage::{
    MemorySnapshotBackend, PostgresSnapshotBackend, SnapshotBackend, StorageAdapter,
};
use crate::sync::SessionRegistry;
use crate::ws::WsState;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config)?;

    if config.is_dev_jwt_secret() {
        warn!("TANDEM_RELAY_JWT_SECRET is not set; using the development-only secret");
    }

    let tokens =
        Arc::new(JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?);
    let (snapshots, permissions) = connect_backends(&config).await?;

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let registry = Arc::new(SessionRegistry::new(StorageAdapter::new(
        snapshots,
        config.storage_config(),
    )));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let persistence = tokio::spawn(
        Arc::clone(&registry).run_persistence_loop(config.persist_interval, shutdown_rx),
    );

    let app = build_router(
        WsState {
            gate: AccessGate::new(tokens, permissions, config.role_revalidate_after),
            registry,
            join_timeout: config.join_timeout,
        },
        relay_metrics,
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly");

    let _ = shutdown_tx.send(true);
    if let Err(join_error) = persistence.await {
        error!(?join_error, "persistence loop did not finish cleanly");
    }

    served
}

fn init_tracing(config: &RelayConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid TANDEM_RELAY_LOG_FILTER: {}", config.log_filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|error| anyhow::anyhow!(error))
    .context("failed to install tracing subscriber")
}

async fn connect_backends(
    config: &RelayConfig,
) -> anyhow::Result<(Arc<dyn SnapshotBackend>, PermissionResolver)> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!(
            "TANDEM_RELAY_DATABASE_URL is not set; using in-memory snapshots and an empty \
             permission table, so every join is refused"
        );
        return Ok((Arc::new(MemorySnapshotBackend::default()), PermissionResolver::in_memory()));
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
    check_pool_health(&pool).await?;
    run_migrations(&pool).await?;

    Ok((Arc::new(PostgresSnapshotBackend::new(pool.clone())), PermissionResolver::Postgres(pool)))
}

fn build_router(ws_state: WsState, relay_metrics: Arc<RelayMetrics>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics))
            .with_state(Arc::clone(&relay_metrics))
            .merge(ws::router(ws_state))
            .fallback(not_found),
        relay_metrics,
    )
}

fn apply_middleware(router: Router, relay_metrics: Arc<RelayMetrics>) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn_with_state(relay_metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(relay_metrics): State<Arc<RelayMetrics>>) -> impl IntoResponse {
    ([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], relay_metrics.render_prometheus())
}

async fn not_found() -> RelayError {
    RelayError::from_code(ErrorCode::NotFound)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(signal_error) = tokio::signal::ctrl_c().await {
            error!(error = %signal_error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(signal_error) => {
                error!(error = %signal_error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(
    State(relay_metrics): State<Arc<RelayMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    relay_metrics.record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}
