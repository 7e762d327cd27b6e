use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::auth::TokenManager;
use crate::breaker::CircuitBreaker;
use crate::config::{Config, Timeouts};
use crate::error::{Error, Result};
use crate::health::HealthChecker;
use crate::models::ModelCatalog;
use crate::pool::{self, WorkerPool};
use crate::proxy::{self, ProxyBody};
use crate::transport::HttpClient;

/// Grace window for in-flight responses during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state behind every request handler. The transport, breaker and
/// worker pool are process-wide singletons by design; they live here as
/// injected collaborators so tests can swap the upstream targets.
pub struct AppState {
    pub timeouts: Timeouts,
    pub transport: Arc<HttpClient>,
    pub tokens: TokenManager,
    pub breaker: CircuitBreaker,
    pub pool: WorkerPool,
    pub catalog: ModelCatalog,
    pub health: HealthChecker,
    pub chat_url: String,
}

impl AppState {
    /// Must be called from within a Tokio runtime; the worker pool spawns
    /// its workers immediately.
    pub fn new(config: &Config, config_path: PathBuf) -> Self {
        let transport = Arc::new(HttpClient::new(&config.timeouts));
        Self {
            timeouts: config.timeouts.clone(),
            tokens: TokenManager::new(transport.clone(), config.clone(), config_path),
            breaker: CircuitBreaker::new(Duration::from_secs(config.timeouts.circuit_breaker)),
            pool: WorkerPool::new(pool::default_workers()),
            catalog: ModelCatalog::new(transport.clone()),
            health: HealthChecker::new(),
            chat_url: proxy::COPILOT_CHAT_URL.to_string(),
            transport,
        }
    }
}

/// Accept loop with signal-driven graceful shutdown. The worker pool is
/// drained before connections are closed so active chat streams can
/// finish inside the grace window.
pub async fn run(state: Arc<AppState>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "proxy server listening");

    let graceful = GracefulShutdown::new();
    let mut shutdown = pin!(shutdown_signal());
    let header_read = Duration::from_secs(state.timeouts.server_read);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal, stopping server");
                break;
            }
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = state.clone();
                let service = service_fn(move |req| handle_request(req, state.clone(), remote));
                let conn = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .keep_alive(true)
                    .header_read_timeout(header_read)
                    .serve_connection(io, service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, remote = %remote, "connection error");
                    }
                });
            }
        }
    }

    info!("draining worker pool");
    state.pool.stop().await;

    tokio::select! {
        _ = graceful.shutdown() => info!("all connections drained"),
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => warn!("grace period elapsed, forcing close"),
    }

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
    remote: SocketAddr,
) -> std::result::Result<Response<ProxyBody>, std::convert::Infallible>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client = client_ip(req.headers(), remote);

    debug!(method = %method, path = %path, client = %client, "request received");

    let mut response = match route(req, state).await {
        Ok(response) => response,
        Err(e) => {
            let response = error_to_response(&e);
            debug!(error = %e, "request error detail");
            response
        }
    };
    apply_security_headers(response.headers_mut());

    let status = response.status().as_u16();
    let duration_ms = started.elapsed().as_millis();
    if status >= 400 {
        warn!(method = %method, path = %path, status, duration_ms, client = %client, "request failed");
    } else {
        info!(method = %method, path = %path, status, duration_ms, client = %client, "request completed");
    }

    Ok(response)
}

async fn route<B>(req: Request<B>, state: Arc<AppState>) -> Result<Response<ProxyBody>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::POST, "/v1/chat/completions") => proxy::handle(state, req).await,

        (Method::GET, "/v1/models") => {
            let list = state.catalog.get().await;
            let body = serde_json::to_vec(&*list)?;
            Ok(json_response(StatusCode::OK, body))
        }

        (Method::GET, "/health") => {
            let report = state.health.check(&state.tokens, &state.breaker).await;
            let status = StatusCode::from_u16(report.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = serde_json::to_vec(&report)?;
            let mut response = json_response(status, body);
            response.headers_mut().insert(
                "Cache-Control",
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            );
            Ok(response)
        }

        (Method::OPTIONS, path) if path.starts_with("/v1/") => Ok(preflight_response()),

        _ => Ok(not_found()),
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).boxed())
        .expect("response construction with valid headers cannot fail")
}

fn error_to_response(error: &Error) -> Response<ProxyBody> {
    let status = error.status_code();
    let body = serde_json::json!({
        "error": {
            "message": error.to_string(),
            "type": error.error_type(),
            "code": status,
        }
    });
    json_response(
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body.to_string().into_bytes(),
    )
}

fn not_found() -> Response<ProxyBody> {
    let body = serde_json::json!({
        "error": { "message": "not found", "type": "invalid_request_error", "code": 404 }
    });
    json_response(StatusCode::NOT_FOUND, body.to_string().into_bytes())
}

fn preflight_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .body(Full::new(Bytes::new()).boxed())
        .expect("response construction with valid headers cannot fail")
}

fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}

/// Client address for logging, honoring proxy forwarding headers.
fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = xff.split(',').next().unwrap_or(xff).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = xri.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    remote.ip().to_string()
}
