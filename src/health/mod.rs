use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Starting,
    Running,
    Error,
    Stopping,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Error => "error",
            RunState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusDetails {
    pub status: RunState,
    pub last_check: Option<DateTime<Utc>>,
    pub last_price: Option<f64>,
    pub last_error: Option<String>,
    pub uptime_start: DateTime<Utc>,
    pub total_checks: u64,
    pub total_alerts: u64,
    pub total_errors: u64,
}

/// Process status shared between the poller and the HTTP endpoint.
#[derive(Debug, Clone)]
pub struct BotStatus {
    symbol: String,
    inner: Arc<RwLock<StatusDetails>>,
}

impl BotStatus {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            inner: Arc::new(RwLock::new(StatusDetails {
                status: RunState::Starting,
                last_check: None,
                last_price: None,
                last_error: None,
                uptime_start: Utc::now(),
                total_checks: 0,
                total_alerts: 0,
                total_errors: 0,
            })),
        }
    }

    pub fn set_state(&self, state: RunState) {
        let mut s = self.inner.write();
        s.status = state;
        s.last_check = Some(Utc::now());
    }

    pub fn record_price(&self, price: f64) {
        let mut s = self.inner.write();
        s.status = RunState::Running;
        s.last_check = Some(Utc::now());
        s.last_price = Some(price);
        s.total_checks += 1;
    }

    pub fn record_error(&self, error: &str) {
        let mut s = self.inner.write();
        s.status = RunState::Error;
        s.last_check = Some(Utc::now());
        s.last_error = Some(error.to_string());
        s.total_errors += 1;
    }

    pub fn increment_alerts(&self) {
        self.inner.write().total_alerts += 1;
    }

    pub fn details(&self) -> StatusDetails {
        self.inner.read().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.read().status == RunState::Running
    }

    pub fn render_metrics(&self) -> String {
        let s = self.details();
        let symbol = &self.symbol;
        format!(
            "# HELP bot_status Bot status (1=running, 0=otherwise)\n\
             # TYPE bot_status gauge\n\
             bot_status{{symbol=\"{symbol}\"}} {}\n\
             \n\
             # HELP bot_total_checks Total number of price checks\n\
             # TYPE bot_total_checks counter\n\
             bot_total_checks{{symbol=\"{symbol}\"}} {}\n\
             \n\
             # HELP bot_total_alerts Total number of alerts sent\n\
             # TYPE bot_total_alerts counter\n\
             bot_total_alerts{{symbol=\"{symbol}\"}} {}\n\
             \n\
             # HELP bot_total_errors Total number of errors\n\
             # TYPE bot_total_errors counter\n\
             bot_total_errors{{symbol=\"{symbol}\"}} {}\n\
             \n\
             # HELP bot_last_price Last fetched stock price\n\
             # TYPE bot_last_price gauge\n\
             bot_last_price{{symbol=\"{symbol}\"}} {}\n",
            u8::from(s.status == RunState::Running),
            s.total_checks,
            s.total_alerts,
            s.total_errors,
            s.last_price.unwrap_or(0.0),
        )
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    details: StatusDetails,
}

async fn health(State(status): State<BotStatus>) -> impl IntoResponse {
    let healthy = status.is_healthy();
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        timestamp: Utc::now(),
        details: status.details(),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn metrics(State(status): State<BotStatus>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        status.render_metrics(),
    )
}

pub fn router(status: BotStatus) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(status)
}

/// Serves the endpoint until `shutdown` flips.
pub async fn serve(port: u16, status: BotStatus, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind health server on port {}", port))?;
    info!("Health check server started on port {}", port);

    axum::serve(listener, router(status))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("health server failed")?;

    info!("Health check server stopped");
    Ok(())
}
