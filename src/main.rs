use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rate_limit_engine::{
    headers::Reply,
    metrics::Metrics,
    request::{IncomingRequest, RouteInfo},
    service::RateLimitService,
    settings::{build_store, load_settings_from_file, Settings},
};

#[derive(Clone)]
struct AppState {
    service: Arc<RateLimitService>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rate_limit_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting rate limit engine");

    // Initialize components
    let metrics = Arc::new(Metrics::new()?);
    let settings = load_settings(&metrics)?;

    let store = build_store(&settings.store).await?;
    let limiter = settings.build_limiter(store)?;
    info!(
        routes = settings.routes.len(),
        hook = ?settings.rate_limit.hook.unwrap_or_default(),
        "Rate limiter configured"
    );

    let service = Arc::new(RateLimitService::new(metrics.clone()));
    service.add_limiter(limiter).await?;

    // Start HTTP server
    let state = AppState { service, metrics };
    let http_addr = settings.server.http_addr;
    let http_server = start_http_server(state, http_addr);

    info!("HTTP server listening on {}", http_addr);

    // Wait for shutdown signal
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

fn load_settings(metrics: &Metrics) -> Result<Settings> {
    let Ok(config_path) = std::env::var("CONFIG_PATH") else {
        info!("CONFIG_PATH not set, using default settings");
        return Ok(Settings::default());
    };

    info!("Loading settings from: {}", config_path);
    match load_settings_from_file(&config_path) {
        Ok(settings) => {
            metrics.record_config_load_success();
            Ok(settings)
        }
        Err(e) => {
            metrics.record_config_load_error();
            Err(e.into())
        }
    }
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    // Health and metrics routes are not rate limited
    let limited = Router::new()
        .route("/", any(echo))
        .route("/*path", any(echo))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .merge(limited)
        .with_state(state)
}

async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let route = RouteInfo::new(parts.method.as_str(), parts.uri.path());
    let incoming = IncomingRequest::from_parts(&parts, Some(peer.ip()));

    match state.service.handle(&route, &incoming).await {
        Ok(Reply {
            status,
            headers,
            body: Some(rejection),
        }) => {
            let mut response = (status, Json(rejection)).into_response();
            response.headers_mut().extend(headers);
            response
        }
        Ok(Reply { headers, .. }) => {
            let mut response = next.run(Request::from_parts(parts, body)).await;
            response.headers_mut().extend(headers);
            response
        }
        Err(e) => {
            warn!(route = %route, error = %e, "Rate limit check failed");
            let status = e.status_code();
            (
                status,
                Json(json!({
                    "statusCode": status.as_u16(),
                    "error": status.canonical_reason().unwrap_or("Error"),
                    "message": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn echo(method: Method, uri: Uri) -> Json<serde_json::Value> {
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
    }))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.service.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rate_limit_engine::{config::RateLimitOptions, limiter::RateLimiter, store::LocalStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn spawn_server(options: RateLimitOptions) -> SocketAddr {
        let metrics = Arc::new(Metrics::new().unwrap());
        let service = Arc::new(RateLimitService::new(metrics.clone()));
        let limiter = RateLimiter::new(options, Arc::new(LocalStore::default())).unwrap();
        service.add_limiter(limiter).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(AppState { service, metrics });
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    async fn status_of(addr: SocketAddr, path: &str) -> u16 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap()
    }

    #[tokio::test]
    async fn test_only_application_routes_are_limited() {
        let addr = spawn_server(RateLimitOptions::new().max(1).time_window(60_000)).await;

        assert_eq!(status_of(addr, "/orders").await, 200);
        assert_eq!(status_of(addr, "/orders").await, 429);
        assert_eq!(status_of(addr, "/").await, 429);

        for _ in 0..3 {
            assert_eq!(status_of(addr, "/healthcheck").await, 200);
            assert_eq!(status_of(addr, "/metrics").await, 200);
        }
    }
}
