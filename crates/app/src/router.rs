use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::dedup::DedupCache;
use crate::pipeline::Pipeline;
use crate::{telemetry, webhook};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    webhook_secret: Arc<[u8]>,
    clock: Clock,
    dedup: DedupCache,
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        webhook_secret: Arc<[u8]>,
        dedup: DedupCache,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            metrics,
            webhook_secret,
            clock: Arc::new(Utc::now),
            dedup,
            pipeline: Arc::new(pipeline),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn webhook_secret(&self) -> &[u8] {
        &self.webhook_secret
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/callback", post(webhook::handle))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}
