//! Local monitoring API.
//!
//! `GET /health` and `GET /status` both sit behind a bearer-token check; no route is served
//! without a token.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::debug;

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::stats::{GlobalStats, StatsSnapshot};
use crate::supervisor::ShutdownRx;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const AUTH_FAILURE_DELAY_MS: std::ops::RangeInclusive<u64> = 100..=200;

#[derive(Clone)]
pub struct MonitorState {
    token: Arc<str>,
    stats: Arc<GlobalStats>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<StatusClock>,
}

impl MonitorState {
    pub fn new(token: &str, stats: Arc<GlobalStats>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            token: Arc::from(token),
            stats,
            breaker,
            clock: Arc::new(StatusClock::default()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub global_stats: StatsSnapshot,
    pub circuit_breaker: BreakerSnapshot,
    pub timestamp: String,
}

/// Wall-clock timestamps in microseconds that never repeat or go backwards between responses.
#[derive(Debug, Default)]
struct StatusClock {
    last_micros: AtomicI64,
}

impl StatusClock {
    fn now(&self) -> String {
        let wall = Utc::now().timestamp_micros();
        let prev = self
            .last_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(wall.max(prev + 1))
            })
            .unwrap_or(wall);
        let micros = wall.max(prev + 1);
        DateTime::from_timestamp_micros(micros)
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

pub fn router(state: MonitorState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state)
}

/// Serve the monitoring API until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    state: MonitorState,
    mut shutdown: ShutdownRx,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            debug!("shutdown received; stopping monitoring API");
        })
        .await
        .context("monitoring API server failed")
}

async fn health(State(state): State<MonitorState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
        timestamp: state.clock.now(),
    })
}

async fn status(State(state): State<MonitorState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: VERSION.to_string(),
        global_stats: state.stats.snapshot(),
        circuit_breaker: state.breaker.snapshot(),
        timestamp: state.clock.now(),
    })
}

async fn require_bearer(
    State(state): State<MonitorState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    if constant_time_eq(presented.as_bytes(), state.token.as_bytes()) {
        return next.run(request).await;
    }

    let delay = rand::rng().random_range(AUTH_FAILURE_DELAY_MS);
    sleep(Duration::from_millis(delay)).await;
    debug!(path = %request.uri().path(), "rejected monitoring request");
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "unauthorized" })),
    )
        .into_response()
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = a.len() ^ b.len();
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
