use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::{AuthError, Error, ProxyError, Result};
use crate::server::AppState;

pub const COPILOT_CHAT_URL: &str = "https://api.githubcopilot.com/chat/completions";

/// Maximum accepted request body size (5 MiB).
pub const MAX_BODY_SIZE: usize = 5 * 1024 * 1024;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_SECS: u64 = 1;

/// Chunk size for the flushed streaming copy.
const STREAM_CHUNK_SIZE: usize = 1024;

/// Header set GitHub Copilot expects on chat traffic, minus Authorization.
const UPSTREAM_HEADERS: &[(&str, &str)] = &[
    ("Content-Type", "application/json"),
    ("Accept", "application/json"),
    ("User-Agent", "GitHubCopilotChat/0.26.7"),
    ("Editor-Version", "vscode/1.99.3"),
    ("Editor-Plugin-Version", "copilot-chat/0.26.7"),
    ("Copilot-Integration-Id", "vscode-chat"),
    ("Openai-Intent", "conversation-edits"),
    ("X-Initiator", "user"),
];

/// Hop-by-hop headers that must not be forwarded; the HTTP layer manages
/// framing for the relayed body itself.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "trailer",
];

pub type ProxyBody = BoxBody<Bytes, Infallible>;

/// Handle `POST /v1/chat/completions`.
///
/// The request is gated by the circuit breaker, its body capped, and the
/// upstream exchange submitted to the worker pool. The handler races job
/// completion against the proxy context deadline; a timeout before the
/// job produced a response maps to 408, and since the response is the
/// single commit point no error can be written after streaming began.
pub async fn handle<B>(state: Arc<AppState>, req: Request<B>) -> Result<Response<ProxyBody>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if !state.breaker.can_execute() {
        warn!("circuit breaker is open, rejecting request");
        return Err(ProxyError::CircuitOpen.into());
    }

    let (parts, body) = req.into_parts();
    let body = read_body_limited(body).await?;
    debug!(body_len = body.len(), "captured request body");

    let deadline = Duration::from_secs(state.timeouts.proxy_context);
    let (done_tx, done_rx) = oneshot::channel();
    let job_state = state.clone();
    let method = parts.method;
    state
        .pool
        .submit(async move {
            let result =
                match tokio::time::timeout(deadline, forward(job_state, method, body)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(deadline)),
                };
            let _ = done_tx.send(result);
        })
        .await?;

    match tokio::time::timeout(deadline, done_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ProxyError::Upstream("worker abandoned the request".into()).into()),
        Err(_) => {
            warn!("request deadline elapsed before the worker responded");
            Err(Error::Timeout(deadline))
        }
    }
}

/// Read the full request body, enforcing the size cap. Exactly
/// `MAX_BODY_SIZE` bytes are accepted; one more is rejected.
async fn read_body_limited<B>(body: B) -> Result<Bytes>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_SIZE).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                Err(ProxyError::BodyTooLarge { max: MAX_BODY_SIZE }.into())
            } else {
                Err(ProxyError::BodyRead(e.to_string()).into())
            }
        }
    }
}

/// Worker-side half of the pipeline: token check, retried upstream call,
/// breaker accounting, response relay.
async fn forward(state: Arc<AppState>, method: Method, body: Bytes) -> Result<Response<ProxyBody>> {
    let token = state.tokens.ensure_valid().await.map_err(|e| match e {
        e @ Error::Auth(_) => e,
        other => Error::Auth(AuthError::RefreshFailed(other.to_string())),
    })?;

    match send_with_retry(&state, &method, &token, &body).await {
        Ok(response) => {
            // 429/408 count toward the retry budget only, not breaker
            // health; anything below 500 is an upstream success.
            if response.status().as_u16() >= 500 {
                state.breaker.on_failure();
            } else {
                state.breaker.on_success();
            }
            Ok(relay(
                response,
                Duration::from_secs(state.timeouts.proxy_context),
            ))
        }
        Err(e) => {
            state.breaker.on_failure();
            Err(e)
        }
    }
}

fn is_retriable_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

/// Quadratic backoff between attempts: 1 s, then 4 s.
fn retry_backoff(failed_attempt: u32) -> Duration {
    Duration::from_secs(RETRY_BASE_SECS * u64::from(failed_attempt) * u64::from(failed_attempt))
}

async fn send_with_retry(
    state: &AppState,
    method: &Method,
    token: &str,
    body: &Bytes,
) -> Result<Response<Incoming>> {
    let mut last_error = None;

    for attempt in 1..=MAX_ATTEMPTS {
        debug!(attempt, max = MAX_ATTEMPTS, "chat completion attempt");
        let req = build_upstream_request(&state.chat_url, method, token, body.clone())?;

        match state.transport.send(req).await {
            Ok(response) => {
                let status = response.status().as_u16();
                if !is_retriable_status(status) {
                    debug!(attempt, status, "upstream responded");
                    return Ok(response);
                }
                if attempt == MAX_ATTEMPTS {
                    warn!(status, attempts = MAX_ATTEMPTS, "upstream still failing, surfacing last response");
                    return Ok(response);
                }
                // Drop the failed response body before the next attempt.
                drop(response);
                let wait = retry_backoff(attempt);
                warn!(status, attempt, wait_secs = wait.as_secs(), "retriable upstream status, backing off");
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                if attempt == MAX_ATTEMPTS {
                    warn!(error = %e, attempts = MAX_ATTEMPTS, "upstream request failed");
                    return Err(e);
                }
                let wait = retry_backoff(attempt);
                warn!(error = %e, attempt, wait_secs = wait.as_secs(), "transport error, backing off");
                last_error = Some(e);
                tokio::time::sleep(wait).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ProxyError::Upstream("retry budget exhausted".into()).into()))
}

fn build_upstream_request(
    url: &str,
    method: &Method,
    token: &str,
    body: Bytes,
) -> Result<Request<Full<Bytes>>> {
    let mut req = Request::builder()
        .method(method.clone())
        .uri(url)
        .header("Authorization", format!("Bearer {token}"));
    for (name, value) in UPSTREAM_HEADERS {
        req = req.header(*name, *value);
    }
    req.body(Full::new(body)).map_err(|e| {
        Error::Proxy(ProxyError::Upstream(format!(
            "failed to build upstream request: {e}"
        )))
    })
}

/// Build the downstream response: upstream status and headers verbatim
/// (minus hop-by-hop), CORS overridden, body relayed. SSE bodies are
/// forwarded in small chunks with each chunk emitted as its own frame so
/// it flushes immediately; other bodies forward whole frames.
fn relay(upstream: Response<Incoming>, deadline: Duration) -> Response<ProxyBody> {
    let (parts, body) = upstream.into_parts();

    let is_sse = parts
        .headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));

    let mut builder = Response::builder().status(parts.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(
            "Access-Control-Allow-Origin",
            HeaderValue::from_static("*"),
        );
        headers.insert(
            "Access-Control-Allow-Headers",
            HeaderValue::from_static("*"),
        );
    }

    let chunk_size = if is_sse { Some(STREAM_CHUNK_SIZE) } else { None };
    builder
        .body(forward_frames(body, deadline, chunk_size))
        .expect("response construction with valid headers cannot fail")
}

/// Copy the upstream body into the client response, terminating on EOF,
/// client disconnect, upstream error or the deadline. Failures after this
/// point are logged only; the status line is already committed.
fn forward_frames(mut body: Incoming, deadline: Duration, chunk_size: Option<usize>) -> ProxyBody {
    let (tx, rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        let copy = async {
            while let Some(frame) = body.frame().await {
                match frame {
                    Ok(frame) => {
                        let Ok(data) = frame.into_data() else {
                            continue;
                        };
                        match chunk_size {
                            Some(size) => {
                                for chunk in data.chunks(size) {
                                    if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            None => {
                                if tx.send(data).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "upstream body error, terminating relay");
                        return;
                    }
                }
            }
            debug!("relay completed");
        };
        if tokio::time::timeout(deadline, copy).await.is_err() {
            debug!("deadline elapsed mid-stream, closing relay");
        }
    });

    let stream = ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
    StreamBody::new(stream).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Timeouts};
    use hyper::StatusCode;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_retriable_status_classification() {
        assert!(is_retriable_status(500));
        assert!(is_retriable_status(502));
        assert!(is_retriable_status(503));
        assert!(is_retriable_status(429));
        assert!(is_retriable_status(408));
        assert!(!is_retriable_status(200));
        assert!(!is_retriable_status(400));
        assert!(!is_retriable_status(401));
        assert!(!is_retriable_status(404));
    }

    #[test]
    fn test_retry_backoff_delays() {
        assert_eq!(retry_backoff(1), Duration::from_secs(1));
        assert_eq!(retry_backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_upstream_request_shape() {
        let req = build_upstream_request(
            COPILOT_CHAT_URL,
            &Method::POST,
            "c_x",
            Bytes::from_static(b"{}"),
        )
        .unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), COPILOT_CHAT_URL);
        let h = req.headers();
        assert_eq!(h["Authorization"], "Bearer c_x");
        assert_eq!(h["Content-Type"], "application/json");
        assert_eq!(h["Accept"], "application/json");
        assert_eq!(h["User-Agent"], "GitHubCopilotChat/0.26.7");
        assert_eq!(h["Editor-Version"], "vscode/1.99.3");
        assert_eq!(h["Editor-Plugin-Version"], "copilot-chat/0.26.7");
        assert_eq!(h["Copilot-Integration-Id"], "vscode-chat");
        assert_eq!(h["Openai-Intent"], "conversation-edits");
        assert_eq!(h["X-Initiator"], "user");
    }

    #[tokio::test]
    async fn test_body_limit_boundary() {
        // Exactly at the cap: accepted.
        let body = Full::new(Bytes::from(vec![0u8; MAX_BODY_SIZE]));
        let read = read_body_limited(body).await.unwrap();
        assert_eq!(read.len(), MAX_BODY_SIZE);

        // One byte over: rejected with the size error.
        let body = Full::new(Bytes::from(vec![0u8; MAX_BODY_SIZE + 1]));
        let err = read_body_limited(body).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Proxy(ProxyError::BodyTooLarge { .. })
        ));
        assert_eq!(err.status_code(), 413);
    }

    /// Upstream stub: replies per the provided status script, then 200
    /// with `{"id":"1"}` once the script is exhausted.
    async fn spawn_upstream(hits: Arc<AtomicUsize>, script: Vec<u16>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script = Arc::new(script);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let hits = hits.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let hits = hits.clone();
                        let script = script.clone();
                        async move {
                            let n = hits.fetch_add(1, Ordering::SeqCst);
                            let status = script.get(n).copied().unwrap_or(200);
                            let response = Response::builder()
                                .status(status)
                                .header("Content-Type", "application/json")
                                .header("X-Upstream", "copilot")
                                .body(Full::new(Bytes::from_static(b"{\"id\":\"1\"}")))
                                .unwrap();
                            Ok::<_, std::convert::Infallible>(response)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        format!("http://{addr}/chat/completions")
    }

    fn authed_config() -> Config {
        let mut cfg = Config::default();
        cfg.copilot_token = "c_x".to_string();
        cfg.github_token = "gh_x".to_string();
        cfg.expires_at = crate::auth::now_unix() + 1400;
        cfg.refresh_in = 1500;
        cfg
    }

    fn test_state(chat_url: String, dir: &TempDir) -> Arc<AppState> {
        let mut timeouts = Timeouts::default();
        timeouts.dial = 1;
        timeouts.http_client = 10;
        timeouts.proxy_context = 10;
        let mut config = authed_config();
        config.timeouts = timeouts;
        let mut state = AppState::new(&config, dir.path().join("config.json"));
        // Point the pipeline at the local stub.
        state.chat_url = chat_url;
        Arc::new(state)
    }

    fn chat_request(body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    async fn body_bytes(response: Response<ProxyBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_proxies_success_with_cors_override() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_upstream(hits.clone(), vec![]).await;
        let dir = TempDir::new().unwrap();
        let state = test_state(url, &dir);

        let response = handle(state.clone(), chat_request(b"{\"model\":\"gpt-4o\"}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["Access-Control-Allow-Origin"], "*");
        assert_eq!(response.headers()["Access-Control-Allow-Headers"], "*");
        // Upstream headers are carried through.
        assert_eq!(response.headers()["X-Upstream"], "copilot");
        assert_eq!(&body_bytes(response).await[..], b"{\"id\":\"1\"}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(state.breaker.can_execute());
    }

    #[tokio::test]
    async fn test_retries_on_server_error_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_upstream(hits.clone(), vec![503]).await;
        let dir = TempDir::new().unwrap();
        let state = test_state(url, &dir);

        let response = handle(state.clone(), chat_request(b"{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        // One failure does not open the breaker, and the final success
        // resets the counter.
        assert!(state.breaker.can_execute());
    }

    #[tokio::test]
    async fn test_non_retriable_error_surfaces_verbatim() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_upstream(hits.clone(), vec![400]).await;
        let dir = TempDir::new().unwrap();
        let state = test_state(url, &dir);

        let response = handle(state, chat_request(b"{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(&body_bytes(response).await[..], b"{\"id\":\"1\"}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_upstream_contact() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_upstream(hits.clone(), vec![]).await;
        let dir = TempDir::new().unwrap();
        let state = test_state(url, &dir);

        for _ in 0..5 {
            state.breaker.on_failure();
        }

        let err = handle(state, chat_request(b"{}")).await.unwrap_err();
        assert!(matches!(err, Error::Proxy(ProxyError::CircuitOpen)));
        assert_eq!(err.status_code(), 503);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sse_stream_relayed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let service = service_fn(|_req: Request<Incoming>| async {
                let frames = "data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: [DONE]\n\n";
                Ok::<_, std::convert::Infallible>(
                    Response::builder()
                        .header("Content-Type", "text/event-stream")
                        .body(Full::new(Bytes::from(frames)))
                        .unwrap(),
                )
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let dir = TempDir::new().unwrap();
        let state = test_state(format!("http://{addr}/chat/completions"), &dir);

        let response = handle(state, chat_request(b"{\"stream\":true}"))
            .await
            .unwrap();

        assert_eq!(
            response.headers()[hyper::header::CONTENT_TYPE],
            "text/event-stream"
        );
        let body = body_bytes(response).await;
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("data: {\"n\":1}"));
        assert!(text.contains("data: [DONE]"));
    }
}
