//! Router assembly and the server lifecycle.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{ConnectInfo, DefaultBodyLimit, Request},
    handler::Handler,
    http::StatusCode,
    middleware,
    routing::{get, post, put},
};
use eyre::{Result, WrapErr};
use hyper::{
    body::Incoming,
    service::{Service, service_fn},
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
    service::TowerToHyperService,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tower_http::timeout::TimeoutLayer;

use crate::{
    adapters::{
        LogMailer, MemoryStore,
        extract::MAX_BODY_BYTES,
        handlers,
        middleware::{
            create_authenticate_middleware, create_cors_middleware, create_metrics_middleware,
            create_rate_limit_middleware, recover_panic, require_permission,
        },
        state::AppState,
    },
    config::{ServerConfig, TimeoutConfig},
    core::auth::{MOVIES_READ, MOVIES_WRITE},
    utils::{BackgroundTasks, ConnectionActivity, GracefulShutdown, ShutdownError, ShutdownToken},
};

const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Build the full application: routes, access gates and the request pipeline.
///
/// Requests pass through the stages outermost first: write timeout, panic
/// recovery, metrics, rate limiting, CORS, authentication, then the route's
/// own access gate and handler.
pub fn build_router(state: AppState) -> Router {
    let perms = state.models.permissions.clone();
    let can_read = || middleware::from_fn(require_permission(MOVIES_READ, perms.clone()));
    let can_write = || middleware::from_fn(require_permission(MOVIES_WRITE, perms.clone()));

    let limiter = state
        .config
        .limiter
        .enabled
        .then(|| state.registry.clone());
    let trusted_origins = Arc::new(state.config.cors.trusted_origins.clone());
    let write_timeout = state.config.timeouts.write();

    Router::new()
        .route("/v1/healthcheck", get(handlers::healthcheck))
        .route(
            "/v1/movies",
            get(handlers::list_movies.layer(can_read()))
                .post(handlers::create_movie.layer(can_write())),
        )
        .route(
            "/v1/movies/{id}",
            get(handlers::show_movie.layer(can_read()))
                .patch(handlers::update_movie.layer(can_write()))
                .delete(handlers::delete_movie.layer(can_write())),
        )
        .route("/v1/users", post(handlers::register_user))
        .route("/v1/users/activated", put(handlers::activate_user))
        .route(
            "/v1/tokens/authentication",
            post(handlers::create_authentication_token),
        )
        .route("/debug/vars", get(handlers::debug_vars))
        .route("/metrics", get(handlers::prometheus_metrics))
        .fallback(handlers::not_found)
        .method_not_allowed_fallback(handlers::method_not_allowed)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        // Layers added later wrap the earlier ones.
        .layer(middleware::from_fn(create_authenticate_middleware(
            state.models.users.clone(),
        )))
        .layer(middleware::from_fn(create_cors_middleware(trusted_origins)))
        .layer(middleware::from_fn(create_rate_limit_middleware(limiter)))
        .layer(middleware::from_fn(create_metrics_middleware(
            state.metrics.clone(),
        )))
        .layer(middleware::from_fn(recover_panic))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::SERVICE_UNAVAILABLE,
            write_timeout,
        ))
        .with_state(state)
}

/// Serve `router` on `listener` until shutdown is requested, then drain.
///
/// Each accepted connection is served by its own task. A client gets
/// `timeouts.read()` to send a request's headers, and a connection with no
/// request in flight for `timeouts.idle()` is closed. Once shutdown starts
/// the listener closes and every connection finishes its current request
/// within the coordinator's grace period. Background tasks then get the
/// background drain budget. Either budget running out is reported as an
/// error.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    timeouts: &TimeoutConfig,
    shutdown: &GracefulShutdown,
    tasks: &BackgroundTasks,
) -> Result<(), ShutdownError> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Starting server");

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read())
        .keep_alive(true);
    let builder = Arc::new(builder);
    let idle = timeouts.idle();

    let mut connections = JoinSet::new();
    let mut token = shutdown.shutdown_token();
    let reason = loop {
        tokio::select! {
            reason = token.wait_for_shutdown() => break reason,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    connections.spawn(serve_connection(
                        builder.clone(),
                        stream,
                        ConnectionActivity::new(remote),
                        router.clone(),
                        idle,
                        shutdown.shutdown_token(),
                    ));
                }
                Err(e) => {
                    // Usually out of file descriptors; give the process room to recover.
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    drop(listener);
    tracing::info!(%reason, open_connections = connections.len(), "Shutting down server");

    let grace = shutdown.grace_period();
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        connections.abort_all();
        return Err(ShutdownError::GracePeriodExceeded(grace));
    }

    let outstanding = tasks.outstanding();
    tracing::info!(%addr, outstanding, "Completing background tasks");

    let waited = shutdown.background_timeout();
    if !tasks.wait_idle_timeout(waited).await {
        return Err(ShutdownError::BackgroundDrainTimeout {
            outstanding: tasks.outstanding(),
            waited,
        });
    }

    tracing::info!(%addr, "Stopped server");
    Ok(())
}

/// Drive one connection until the client hangs up, it idles out, or shutdown
/// asks it to finish its current request and close.
async fn serve_connection(
    builder: Arc<auto::Builder<TokioExecutor>>,
    stream: TcpStream,
    activity: Arc<ConnectionActivity>,
    router: Router,
    idle: Duration,
    mut shutdown: ShutdownToken,
) {
    let remote = activity.remote_addr();
    let service = {
        let activity = activity.clone();
        let router = TowerToHyperService::new(router);
        service_fn(move |mut req: Request<Incoming>| {
            // Rate limiting identifies clients by their peer address.
            req.extensions_mut().insert(ConnectInfo(remote));
            let request = activity.begin_request();
            let response = router.call(req);
            async move {
                let _request = request;
                response.await
            }
        })
    };

    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut closing = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(%remote, error = %e, "Connection ended with error");
                }
                break;
            }
            _ = shutdown.wait_for_shutdown(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = activity.idle_expired(idle), if !closing => {
                tracing::debug!(%remote, ?idle, "Closing idle connection");
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }

    tracing::trace!(%remote, age = ?activity.age(), "Connection closed");
}

/// Wire the in-memory collaborators, bind the listener and run until a
/// signal arrives. When `exporter` is given, request metrics are served in
/// Prometheus format at `/metrics`.
pub async fn run(config: ServerConfig, exporter: Option<PrometheusHandle>) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .wrap_err_with(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let shutdown = Arc::new(GracefulShutdown::from_config(&config.shutdown));
    let tasks = BackgroundTasks::new();
    let mailer = Arc::new(LogMailer::new(config.mailer.sender.clone()));
    let timeouts = config.timeouts.clone();
    let mut state = AppState::new(config, MemoryStore::models(), mailer, tasks.clone());
    if let Some(exporter) = exporter {
        state = state.with_exporter(exporter);
    }
    tracing::info!(
        env = %state.config.env,
        limiter.enabled = state.config.limiter.enabled,
        limiter.rps = state.config.limiter.rps,
        limiter.burst = state.config.limiter.burst,
        metrics.exported = state.exporter.is_some(),
        "Application configured"
    );

    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind to {addr}"))?;

    let signal_handler = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!(error = ?e, "Signal handler failed");
            }
        })
    };

    let result = serve(listener, build_router(state), &timeouts, &shutdown, &tasks).await;
    signal_handler.abort();

    result.wrap_err("Server did not shut down cleanly")
}
