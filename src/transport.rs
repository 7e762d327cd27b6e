use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::Timeouts;
use crate::error::{Error, Result};

/// Upper bound on concurrently in-flight upstream requests. The legacy
/// client pool has no total-connection cap of its own, so admission is
/// enforced here.
const MAX_IN_FLIGHT: usize = 100;

/// Idle connections kept per upstream host.
const MAX_IDLE_PER_HOST: usize = 50;

type Connector = hyper_rustls::HttpsConnector<HttpConnector>;

/// Process-wide outbound HTTP client.
///
/// One instance is shared by the token manager, the proxy pipeline and the
/// model catalog so that connection pooling is amortized across all
/// upstream traffic. Timeouts come from [`Timeouts`]: `dial` bounds
/// connection establishment, `keep_alive` tunes TCP keep-alive,
/// `idle_connection` expires pooled connections, and `http_client` is the
/// per-request deadline.
pub struct HttpClient {
    client: Client<Connector, Full<Bytes>>,
    limiter: Semaphore,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new(timeouts: &Timeouts) -> Self {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(Duration::from_secs(timeouts.dial)));
        http.set_keepalive(Some(Duration::from_secs(timeouts.keep_alive)));
        http.enforce_http(false);

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(timeouts.idle_connection))
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build(connector);

        Self {
            client,
            limiter: Semaphore::new(MAX_IN_FLIGHT),
            request_timeout: Duration::from_secs(timeouts.http_client),
        }
    }

    /// Send a request and return the response with its body still
    /// streaming. The deadline covers connection + response headers; the
    /// caller bounds the body read.
    pub async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| Error::Network {
                operation: "acquire connection",
                message: "transport is shut down".to_string(),
            })?;

        match tokio::time::timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::Network {
                operation: "upstream request",
                message: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }

    /// Send a request and buffer the full response body. The deadline
    /// covers the entire exchange.
    pub async fn send_buffered(&self, req: Request<Full<Bytes>>) -> Result<(u16, Bytes)> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| Error::Network {
                operation: "acquire connection",
                message: "transport is shut down".to_string(),
            })?;

        let exchange = async {
            let response = self.client.request(req).await.map_err(|e| Error::Network {
                operation: "upstream request",
                message: e.to_string(),
            })?;
            let status = response.status().as_u16();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::Network {
                    operation: "read response body",
                    message: e.to_string(),
                })?
                .to_bytes();
            Ok::<_, Error>((status, body))
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }

    pub async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<(u16, Bytes)> {
        let mut req = Request::builder().method("GET").uri(url);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let req = req
            .body(Full::new(Bytes::new()))
            .map_err(|e| Error::Network {
                operation: "build request",
                message: e.to_string(),
            })?;
        self.send_buffered(req).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<(u16, Bytes)> {
        let mut req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let req = req
            .body(Full::new(Bytes::from(serde_json::to_vec(body)?)))
            .map_err(|e| Error::Network {
                operation: "build request",
                message: e.to_string(),
            })?;
        self.send_buffered(req).await
    }
}
