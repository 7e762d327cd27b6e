use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::now_unix;
use crate::coalesce::{CoalescingCache, fingerprint};
use crate::error::{Error, Result};
use crate::transport::HttpClient;

pub const MODELS_DEV_URL: &str = "https://models.dev/api.json";

/// Provider section of the models.dev catalog that maps to this proxy.
const CATALOG_PROVIDER: &str = "github-copilot";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl Model {
    fn new(id: impl Into<String>, owned_by: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created,
            owned_by: owned_by.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<Model>,
}

impl ModelList {
    pub fn new(data: Vec<Model>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

/// Hardcoded catalog used when every remote source fails.
pub fn default_models() -> Vec<Model> {
    let created = now_unix();
    vec![
        Model::new("gpt-4o", "openai", created),
        Model::new("gpt-4.1", "openai", created),
        Model::new("o3", "openai", created),
        Model::new("o3-mini", "openai", created),
        Model::new("o4-mini", "openai", created),
        Model::new("claude-3.5-sonnet", "anthropic", created),
        Model::new("claude-3.7-sonnet", "anthropic", created),
        Model::new("claude-3.7-sonnet-thought", "anthropic", created),
        Model::new("claude-opus-4", "anthropic", created),
        Model::new("claude-sonnet-4", "anthropic", created),
        Model::new("gemini-2.5-pro", "google", created),
        Model::new("gemini-2.0-flash-001", "google", created),
    ]
}

/// Case-insensitive ASCII substring check without allocation.
fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Classify a model's owner from its name when the catalog leaves
/// `owned_by` empty.
fn classify_owner(name: &str) -> &'static str {
    const ANTHROPIC: &[&str] = &["claude", "anthropic"];
    const OPENAI: &[&str] = &["gpt", "o1", "o3", "o4", "openai"];
    const GOOGLE: &[&str] = &["gemini", "google"];

    if ANTHROPIC.iter().any(|s| contains_ignore_case(name, s)) {
        "anthropic"
    } else if OPENAI.iter().any(|s| contains_ignore_case(name, s)) {
        "openai"
    } else if GOOGLE.iter().any(|s| contains_ignore_case(name, s)) {
        "google"
    } else {
        "github-copilot"
    }
}

#[derive(Debug, Deserialize)]
struct CatalogProvider {
    #[serde(default)]
    models: HashMap<String, CatalogModel>,
}

#[derive(Debug, Deserialize)]
struct CatalogModel {
    #[serde(default)]
    name: String,
    #[serde(default)]
    owned_by: String,
}

/// Model catalog service with a process-level cache and coalesced fetches.
///
/// The first request populates the cache through a fallback chain
/// (models.dev, then the hardcoded defaults); concurrent cold-cache
/// requests collapse into a single fetch and share the resulting list by
/// identity.
pub struct ModelCatalog {
    client: Arc<HttpClient>,
    catalog_url: String,
    cached: RwLock<Option<Arc<ModelList>>>,
    inflight: CoalescingCache<Arc<ModelList>>,
}

impl ModelCatalog {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self::with_url(client, MODELS_DEV_URL.to_string())
    }

    pub fn with_url(client: Arc<HttpClient>, catalog_url: String) -> Self {
        Self {
            client,
            catalog_url,
            cached: RwLock::new(None),
            inflight: CoalescingCache::new(),
        }
    }

    pub async fn get(&self) -> Arc<ModelList> {
        let key = fingerprint("GET", "/v1/models", b"");
        self.inflight.coalesce(&key, || self.load()).await
    }

    async fn load(&self) -> Arc<ModelList> {
        if let Some(cached) = self.cached.read().clone() {
            return cached;
        }

        info!("loading model catalog");
        let list = match self.fetch_remote().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "model catalog fetch failed, using default catalog");
                ModelList::new(default_models())
            }
        };

        let mut cached = self.cached.write();
        if let Some(existing) = cached.as_ref() {
            return existing.clone();
        }
        let list = Arc::new(list);
        *cached = Some(list.clone());
        info!(count = list.data.len(), "cached model catalog");
        list
    }

    async fn fetch_remote(&self) -> Result<ModelList> {
        debug!(url = %self.catalog_url, "fetching model catalog");
        let (status, bytes) = self
            .client
            .get(&self.catalog_url, &[("Accept", "application/json")])
            .await?;
        if status != 200 {
            return Err(Error::Network {
                operation: "fetch model catalog",
                message: format!("catalog source returned HTTP {status}"),
            });
        }

        let mut providers: HashMap<String, CatalogProvider> = serde_json::from_slice(&bytes)?;
        let provider = providers
            .remove(CATALOG_PROVIDER)
            .ok_or_else(|| Error::Network {
                operation: "fetch model catalog",
                message: format!("provider '{CATALOG_PROVIDER}' not present in catalog"),
            })?;

        let created = now_unix();
        let models = provider
            .models
            .into_iter()
            .map(|(id, entry)| {
                let owned_by = if entry.owned_by.is_empty() {
                    let name = if entry.name.is_empty() { &id } else { &entry.name };
                    classify_owner(name).to_string()
                } else {
                    entry.owned_by
                };
                Model::new(id, owned_by, created)
            })
            .collect();

        Ok(ModelList::new(models))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_classify_owner() {
        assert_eq!(classify_owner("Claude 3.5 Sonnet"), "anthropic");
        assert_eq!(classify_owner("anthropic-x"), "anthropic");
        assert_eq!(classify_owner("GPT-4o"), "openai");
        assert_eq!(classify_owner("o3-mini"), "openai");
        assert_eq!(classify_owner("o4-mini"), "openai");
        assert_eq!(classify_owner("Gemini 2.5 Pro"), "google");
        assert_eq!(classify_owner("grok-foo"), "github-copilot");
    }

    #[test]
    fn test_default_catalog_contents() {
        let models = default_models();
        assert_eq!(models.len(), 12);
        assert_eq!(
            models.iter().filter(|m| m.owned_by == "openai").count(),
            5
        );
        assert_eq!(
            models.iter().filter(|m| m.owned_by == "anthropic").count(),
            5
        );
        assert_eq!(
            models.iter().filter(|m| m.owned_by == "google").count(),
            2
        );
        assert!(models.iter().all(|m| m.object == "model"));
        assert_eq!(models[0].id, "gpt-4o");
    }

    #[test]
    fn test_model_list_serialization_shape() {
        let list = ModelList::new(vec![Model::new("gpt-4o", "openai", 1)]);
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["object"], "model");
        assert_eq!(json["data"][0]["id"], "gpt-4o");
        assert_eq!(json["data"][0]["owned_by"], "openai");
    }

    fn catalog_fixture() -> String {
        serde_json::json!({
            "github-copilot": {
                "id": "github-copilot",
                "models": {
                    "gpt-4o": { "id": "gpt-4o", "name": "GPT-4o" },
                    "claude-sonnet-4": { "id": "claude-sonnet-4", "name": "Claude Sonnet 4" },
                    "custom": { "id": "custom", "name": "In-House", "owned_by": "acme" },
                    "mystery": { "id": "mystery", "name": "Mystery Model" }
                }
            },
            "other-provider": { "id": "other-provider", "models": {} }
        })
        .to_string()
    }

    async fn spawn_catalog_endpoint(hits: Arc<AtomicUsize>, body: String) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let hits = hits.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                        let hits = hits.clone();
                        let body = body.clone();
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .header("Content-Type", "application/json")
                                    .body(Full::new(Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        format!("http://{addr}/api.json")
    }

    fn test_client() -> Arc<HttpClient> {
        let mut timeouts = Timeouts::default();
        timeouts.dial = 1;
        timeouts.http_client = 5;
        Arc::new(HttpClient::new(&timeouts))
    }

    #[tokio::test]
    async fn test_remote_catalog_parse_and_classification() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_catalog_endpoint(hits, catalog_fixture()).await;
        let catalog = ModelCatalog::with_url(test_client(), url);

        let list = catalog.get().await;
        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), 4);

        let owner = |id: &str| {
            list.data
                .iter()
                .find(|m| m.id == id)
                .map(|m| m.owned_by.clone())
                .unwrap()
        };
        assert_eq!(owner("gpt-4o"), "openai");
        assert_eq!(owner("claude-sonnet-4"), "anthropic");
        // Explicit owned_by wins over classification.
        assert_eq!(owner("custom"), "acme");
        assert_eq!(owner("mystery"), "github-copilot");
    }

    #[tokio::test]
    async fn test_concurrent_cold_fetches_coalesce() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_catalog_endpoint(hits.clone(), catalog_fixture()).await;
        let catalog = Arc::new(ModelCatalog::with_url(test_client(), url));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let catalog = catalog.clone();
            tasks.push(tokio::spawn(async move { catalog.get().await }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        for list in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], list));
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_falls_back_to_defaults() {
        // Nothing listens on this port; the fallback chain ends at the
        // hardcoded catalog.
        let catalog =
            ModelCatalog::with_url(test_client(), "http://127.0.0.1:9/api.json".to_string());

        let list = catalog.get().await;
        assert_eq!(list.data.len(), 12);
        assert!(list.data.iter().any(|m| m.id == "claude-opus-4"));

        // The fallback result is cached like any other.
        let again = catalog.get().await;
        assert!(Arc::ptr_eq(&list, &again));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_refetch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_catalog_endpoint(hits.clone(), catalog_fixture()).await;
        let catalog = ModelCatalog::with_url(test_client(), url);

        let first = catalog.get().await;
        let second = catalog.get().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
