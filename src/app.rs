use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::auth::{
    self,
    extractors::client_ip,
    rate_limit::{Identity, RateLimitPolicy, RateLimiter},
};
use crate::config::AppConfig;
use crate::errors::AppError;
use crate::state::AppState;

const SERVER_WIDE_LIMIT: RateLimitPolicy = RateLimitPolicy {
    window: Duration::from_secs(10 * 60),
    max: 150,
    limit_by_variables: false,
    message: Some("Too many requests, please try again later."),
};

pub fn build_app(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .merge(auth::router())
        .route("/health", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(state.clone(), server_rate_limit))
        .with_state(state)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!("http_request", %method, uri = %uri)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     _latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        if status.is_server_error() {
                            tracing::error!(%status, "response");
                        } else {
                            tracing::info!(%status, "response");
                        }
                    },
                ),
        )
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        config.frontend_url.clone(),
        format!("http://localhost:{}", config.port),
        "https://studio.apollographql.com".to_string(),
    ]
    .iter()
    .filter_map(|origin| match origin.parse::<HeaderValue>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(%origin, error = %e, "skipping invalid CORS origin");
            None
        }
    })
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// Per-IP request budget shared by every route. Cache failures let the
/// request through.
async fn server_rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let identity =
        client_ip(req.headers(), req.extensions(), state.config.trust_proxy).map(Identity::Ip);
    let limiter = RateLimiter::new(state.cache.clone());
    match limiter.hit("server", None, identity, &SERVER_WIDE_LIMIT).await {
        Ok(()) => next.run(req).await,
        Err(AppError::RateLimitExceeded(message)) => {
            (StatusCode::TOO_MANY_REQUESTS, message).into_response()
        }
        Err(e) => {
            error!(error = %e, "server rate limit check failed");
            next.run(req).await
        }
    }
}

pub async fn serve(app: Router, config: &AppConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("parse listen address")?;

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server error")?;

    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
