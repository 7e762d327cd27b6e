use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AuthError, Error, Result};
use crate::transport::HttpClient;

pub const DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
pub const ACCESS_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
pub const COPILOT_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";

pub const CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
pub const SCOPE: &str = "read:user";
pub const USER_AGENT: &str = "GitHubCopilotChat/0.26.7";

const MAX_REFRESH_RETRIES: u32 = 3;
const REFRESH_RETRY_BASE_SECS: u64 = 2;
const MAX_POLL_ITERATIONS: u32 = 120;

/// A token already valid for at least this long skips re-authentication.
const AUTH_SKIP_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    interval: u64,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Deserialize)]
struct CopilotTokenResponse {
    token: String,
    expires_at: i64,
    #[serde(default)]
    refresh_in: i64,
}

/// Upstream OAuth endpoints, swappable for tests.
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub device_code: String,
    pub access_token: String,
    pub copilot_token: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            device_code: DEVICE_CODE_URL.to_string(),
            access_token: ACCESS_TOKEN_URL.to_string(),
            copilot_token: COPILOT_TOKEN_URL.to_string(),
        }
    }
}

/// Read-only token snapshot for the CLI.
#[derive(Debug, Clone)]
pub struct TokenStatus {
    pub authenticated: bool,
    pub has_github_token: bool,
    pub refresh_in: i64,
    pub seconds_remaining: i64,
    pub refresh_threshold: i64,
}

/// Refresh when at most `max(300, refresh_in / 5)` seconds of lifetime
/// remain: 20% of the nominal lifetime, floored at five minutes.
pub fn refresh_threshold(refresh_in: i64) -> i64 {
    (refresh_in / 5).max(300)
}

/// Quadratic backoff between refresh attempts: 2 s, then 8 s.
fn refresh_backoff(failed_attempt: u32) -> Duration {
    Duration::from_secs(REFRESH_RETRY_BASE_SECS * u64::from(failed_attempt) * u64::from(failed_attempt))
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Owns the token lifecycle: device-flow bootstrap, proactive refresh and
/// persistence of new tokens.
///
/// All request-path checks go through `ensure_valid`, which holds the
/// config write lock across both the staleness check and the exchange, so
/// concurrent callers serialize and at most one refresh is in flight;
/// racers observe the refreshed token and skip their own exchange. Status
/// reads take the shared side only.
pub struct TokenManager {
    client: Arc<HttpClient>,
    endpoints: AuthEndpoints,
    config: RwLock<Config>,
    config_path: PathBuf,
}

impl TokenManager {
    pub fn new(client: Arc<HttpClient>, config: Config, config_path: PathBuf) -> Self {
        Self::with_endpoints(client, config, config_path, AuthEndpoints::default())
    }

    pub fn with_endpoints(
        client: Arc<HttpClient>,
        config: Config,
        config_path: PathBuf,
        endpoints: AuthEndpoints,
    ) -> Self {
        Self {
            client,
            endpoints,
            config: RwLock::new(config),
            config_path,
        }
    }

    /// Ensure the stored Copilot token is usable and return it. Refreshes
    /// proactively within the refresh threshold; a failed refresh falls
    /// back to full device-flow authentication.
    pub async fn ensure_valid(&self) -> Result<String> {
        let mut cfg = self.config.write().await;
        let now = now_unix();

        if cfg.copilot_token.is_empty() {
            info!("no Copilot token stored, starting authentication");
            self.authenticate_locked(&mut cfg, now).await?;
            return Ok(cfg.copilot_token.clone());
        }

        let remaining = cfg.expires_at - now;
        let threshold = refresh_threshold(cfg.refresh_in);
        if remaining <= threshold {
            info!(
                remaining_secs = remaining,
                threshold_secs = threshold,
                "token within refresh threshold, refreshing"
            );
            if let Err(e) = self.refresh_locked(&mut cfg).await {
                warn!(error = %e, "token refresh failed, falling back to authentication");
                self.authenticate_locked(&mut cfg, now).await?;
            }
        }

        Ok(cfg.copilot_token.clone())
    }

    /// Run the device flow unless the current token still has more than a
    /// minute of life left.
    pub async fn authenticate(&self) -> Result<()> {
        let mut cfg = self.config.write().await;
        let now = now_unix();
        self.authenticate_locked(&mut cfg, now).await
    }

    /// Force a token refresh from the stored GitHub token.
    pub async fn refresh(&self) -> Result<()> {
        let mut cfg = self.config.write().await;
        self.refresh_locked(&mut cfg).await
    }

    pub async fn status(&self) -> TokenStatus {
        let cfg = self.config.read().await;
        let now = now_unix();
        TokenStatus {
            authenticated: !cfg.copilot_token.is_empty(),
            has_github_token: !cfg.github_token.is_empty(),
            refresh_in: cfg.refresh_in,
            seconds_remaining: cfg.expires_at - now,
            refresh_threshold: refresh_threshold(cfg.refresh_in),
        }
    }

    async fn authenticate_locked(&self, cfg: &mut Config, now: i64) -> Result<()> {
        if !cfg.copilot_token.is_empty() && cfg.expires_at > now + AUTH_SKIP_MARGIN_SECS {
            info!(
                remaining_secs = cfg.expires_at - now,
                "token still valid, skipping authentication"
            );
            return Ok(());
        }

        let device = self.request_device_code().await?;
        println!(
            "\nTo authenticate, visit: {}\nEnter code: {}\n",
            device.verification_uri, device.user_code
        );
        info!(verification_uri = %device.verification_uri, "waiting for device authorization");

        let github_token = self.poll_access_token(&device).await?;
        cfg.github_token = github_token;

        let grant = self.exchange_copilot_token(&cfg.github_token).await?;
        cfg.copilot_token = grant.token;
        cfg.expires_at = grant.expires_at;
        cfg.refresh_in = grant.refresh_in;
        cfg.save_to(&self.config_path)?;

        info!(
            expires_in_secs = cfg.expires_at - now_unix(),
            "authentication successful"
        );
        Ok(())
    }

    async fn refresh_locked(&self, cfg: &mut Config) -> Result<()> {
        if cfg.github_token.is_empty() {
            return Err(AuthError::NoToken.into());
        }

        for attempt in 1..=MAX_REFRESH_RETRIES {
            info!(attempt, max = MAX_REFRESH_RETRIES, "refreshing Copilot token");
            match self.exchange_copilot_token(&cfg.github_token).await {
                Ok(grant) => {
                    info!(
                        expires_in_secs = grant.expires_at - now_unix(),
                        "token refresh successful"
                    );
                    cfg.copilot_token = grant.token;
                    cfg.expires_at = grant.expires_at;
                    cfg.refresh_in = grant.refresh_in;
                    return cfg.save_to(&self.config_path);
                }
                Err(e) if attempt < MAX_REFRESH_RETRIES => {
                    let wait = refresh_backoff(attempt);
                    warn!(attempt, wait_secs = wait.as_secs(), error = %e, "refresh attempt failed, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!(error = %e, "token refresh failed after {MAX_REFRESH_RETRIES} attempts");
                    return Err(e);
                }
            }
        }

        Err(AuthError::RefreshFailed("retry budget exhausted".into()).into())
    }

    async fn request_device_code(&self) -> Result<DeviceCodeResponse> {
        let body = serde_json::json!({ "client_id": CLIENT_ID, "scope": SCOPE });
        let (status, bytes) = self
            .client
            .post_json(
                &self.endpoints.device_code,
                &[("User-Agent", USER_AGENT)],
                &body,
            )
            .await?;
        if status != 200 {
            return Err(AuthError::DeviceFlow(format!(
                "device code endpoint returned HTTP {status}"
            ))
            .into());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::DeviceFlow(format!("invalid device code response: {e}")).into())
    }

    /// Poll the access-token endpoint at the server-specified interval.
    /// Continues while authorization is pending, fails on any other error
    /// code and succeeds on a non-empty access token.
    async fn poll_access_token(&self, device: &DeviceCodeResponse) -> Result<String> {
        let interval = Duration::from_secs(device.interval.max(1));
        let body = serde_json::json!({
            "client_id": CLIENT_ID,
            "device_code": device.device_code,
            "grant_type": "urn:ietf:params:oauth:grant-type:device_code",
        });

        for _ in 0..MAX_POLL_ITERATIONS {
            tokio::time::sleep(interval).await;

            let poll = self
                .client
                .post_json(
                    &self.endpoints.access_token,
                    &[("User-Agent", USER_AGENT)],
                    &body,
                )
                .await;
            let (_, bytes) = match poll {
                Ok(ok) => ok,
                // Transient network failure; keep polling.
                Err(_) => continue,
            };

            let token: AccessTokenResponse = match serde_json::from_slice(&bytes) {
                Ok(t) => t,
                Err(_) => continue,
            };

            if !token.error.is_empty() {
                if token.error == "authorization_pending" {
                    continue;
                }
                return Err(AuthError::DeviceFlow(format!(
                    "{} - {}",
                    token.error, token.error_description
                ))
                .into());
            }

            if !token.access_token.is_empty() {
                return Ok(token.access_token);
            }
        }

        Err(AuthError::DeviceFlowTimedOut.into())
    }

    /// Exchange a GitHub OAuth token for a short-lived Copilot session
    /// token. A non-200 response is a hard error.
    async fn exchange_copilot_token(&self, github_token: &str) -> Result<CopilotTokenResponse> {
        let auth = format!("token {github_token}");
        let (status, bytes) = self
            .client
            .get(
                &self.endpoints.copilot_token,
                &[
                    ("Authorization", auth.as_str()),
                    ("User-Agent", USER_AGENT),
                    ("Accept", "application/json"),
                ],
            )
            .await?;
        if status != 200 {
            return Err(AuthError::Rejected { status }.into());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::Auth(AuthError::RefreshFailed(format!(
                "invalid token response: {e}"
            )))
        })
    }
}
