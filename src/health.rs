use serde::Serialize;
use std::time::Instant;

use crate::auth::{TokenManager, now_unix};
use crate::breaker::{BreakerState, CircuitBreaker};

pub const SERVICE_NAME: &str = "github-copilot-svcs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    fn worse(self, other: HealthState) -> HealthState {
        use HealthState::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: HealthState,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: i64,
    pub uptime_seconds: u64,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn http_status(&self) -> u16 {
        match self.status {
            HealthState::Unhealthy => 503,
            _ => 200,
        }
    }
}

/// Aggregates named component checks into one service-level status.
pub struct HealthChecker {
    started: Instant,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub async fn check(&self, tokens: &TokenManager, breaker: &CircuitBreaker) -> HealthReport {
        let checks = vec![self.check_token(tokens).await, self.check_breaker(breaker)];

        let status = checks
            .iter()
            .fold(HealthState::Healthy, |acc, c| acc.worse(c.status));

        HealthReport {
            status,
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: now_unix(),
            uptime_seconds: self.started.elapsed().as_secs(),
            checks,
        }
    }

    async fn check_token(&self, tokens: &TokenManager) -> HealthCheck {
        let status = tokens.status().await;
        let (state, message) = if !status.authenticated {
            (
                HealthState::Degraded,
                "no Copilot token; authentication will run on first request".to_string(),
            )
        } else if status.seconds_remaining <= 0 {
            (
                HealthState::Degraded,
                "Copilot token expired; will refresh on next request".to_string(),
            )
        } else {
            (
                HealthState::Healthy,
                format!("token valid for {} more seconds", status.seconds_remaining),
            )
        };
        HealthCheck {
            name: "token",
            status: state,
            message,
        }
    }

    fn check_breaker(&self, breaker: &CircuitBreaker) -> HealthCheck {
        let (state, message) = match breaker.state() {
            BreakerState::Closed => (HealthState::Healthy, "circuit closed".to_string()),
            BreakerState::HalfOpen => (
                HealthState::Degraded,
                "circuit half-open; probing upstream".to_string(),
            ),
            BreakerState::Open => (
                HealthState::Unhealthy,
                "circuit open; upstream is failing".to_string(),
            ),
        };
        HealthCheck {
            name: "upstream",
            status: state,
            message,
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
