use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

// Consts

const UNMATCHED_PATH: &str = "unmatched";

// Metrics

/// HTTP request metrics, exported in the Prometheus text format.
#[derive(Clone)]
pub struct Metrics {
    durations: HistogramVec,
    registry: Registry,
    requests: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Number of HTTP requests"),
            &["handler", "code"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        let durations = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Duration of HTTP requests",
            ),
            &["handler"],
        )?;
        registry.register(Box::new(durations.clone()))?;
        Ok(Self {
            durations,
            registry,
            requests,
        })
    }

    pub fn export(&self) -> prometheus::Result<String> {
        let mut buf = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }

    pub fn observe(&self, handler: &str, code: StatusCode, secs: f64) {
        self.requests
            .with_label_values(&[handler, code.as_str()])
            .inc();
        self.durations.with_label_values(&[handler]).observe(secs);
    }
}

// Functions

pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(export))
        .with_state(metrics)
}

pub async fn track(State(metrics): State<Metrics>, req: Request, next: Next) -> Response {
    let handler = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_PATH.into());
    let start = Instant::now();
    let resp = next.run(req).await;
    metrics.observe(&handler, resp.status(), start.elapsed().as_secs_f64());
    resp
}

async fn export(State(metrics): State<Metrics>) -> Response {
    match metrics.export() {
        Ok(body) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(err) => {
            error!("failed to export metrics: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// Tests

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn observe() {
        let metrics = Metrics::new().unwrap();
        metrics.observe("/sys/info/ping", StatusCode::OK, 0.01);
        metrics.observe("/sys/info/ping", StatusCode::OK, 0.02);
        let text = metrics.export().unwrap();
        assert!(text.contains(r#"http_requests_total{code="200",handler="/sys/info/ping"} 2"#));
        assert!(text.contains("http_request_duration_seconds_count"));
    }
}
