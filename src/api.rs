use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{JobError, ValidationError};
use crate::job::{run_analysis, CompletedJob};
use crate::metrics::Metrics;
use crate::request::{AnalysisRequest, AnalyzeBody};
use crate::session::{spawn_streaming, SseFrame};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let mut r = Router::new()
        .route("/", get(service_info))
        .route("/api/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/analyze/stream", post(analyze_stream));

    if state.config.debug_routes {
        if let Some(m) = Metrics::global() {
            r = r.merge(m.router::<AppState>());
        }
    }

    r.layer(CorsLayer::very_permissive()).with_state(state)
}

fn validate(body: Result<Json<AnalyzeBody>, JsonRejection>) -> Result<AnalysisRequest, ValidationError> {
    let Json(body) = body.map_err(|rej| ValidationError::MalformedBody(rej.body_text()))?;
    AnalysisRequest::try_from(body)
}

fn bad_request(e: ValidationError) -> Response {
    warn!(target: "api", error = %e, "rejected analysis request");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "error", "message": e.to_string() })),
    )
        .into_response()
}

fn failure_body(config: &BridgeConfig, e: &JobError) -> Value {
    let mut body = json!({ "status": "error", "message": e.to_string() });
    if config.dev_mode {
        body["error"] = Value::String(e.detail());
    }
    body
}

fn success_body(done: &CompletedJob) -> Value {
    json!({ "status": "success", "data": done.result, "timing": done.timing })
}

async fn service_info() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Runs the financial research analyst and relays its progress and results.",
        "endpoints": {
            "GET /": "Service metadata",
            "GET /api/health": "Health check",
            "POST /api/analyze": "Run an analysis and wait for the result",
            "POST /api/analyze/stream": "Run an analysis with live progress (text/event-stream)",
        }
    }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Research bridge is running",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn analyze(
    State(state): State<AppState>,
    body: Result<Json<AnalyzeBody>, JsonRejection>,
) -> Response {
    let req = match validate(body) {
        Ok(r) => r,
        Err(e) => return bad_request(e),
    };
    info!(target: "api", ticker = %req.ticker, horizon = %req.horizon, risk_profile = %req.risk_profile, "analysis requested");

    // detached so a dropped connection does not kill the child
    let cfg = state.config.clone();
    let task = tokio::spawn(async move { run_analysis(&cfg, &req).await });
    let outcome = task.await.unwrap_or_else(|e| {
        Err(JobError::Io(std::io::Error::other(format!("analysis task failed: {e}"))))
    });

    match outcome {
        Ok(done) => (StatusCode::OK, Json(success_body(&done))).into_response(),
        Err(e) => {
            error!(target: "api", error = %e, kind = e.kind(), "analysis failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(failure_body(&state.config, &e))).into_response()
        }
    }
}

async fn analyze_stream(
    State(state): State<AppState>,
    body: Result<Json<AnalyzeBody>, JsonRejection>,
) -> Response {
    let req = match validate(body) {
        Ok(r) => r,
        Err(e) => return bad_request(e),
    };
    info!(target: "api", ticker = %req.ticker, horizon = %req.horizon, risk_profile = %req.risk_profile, "streaming analysis requested");

    let frames = spawn_streaming(state.config.clone(), req);
    let mut resp = Sse::new(frame_stream(frames)).into_response();
    let headers = resp.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}

/// Response body; ends after the terminal frame or when the session releases its transport.
fn frame_stream(frames: UnboundedReceiver<SseFrame>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(frames), |rx| async move {
        let mut rx = rx?;
        let frame = rx.recv().await?;
        let next = (!frame.is_terminal()).then_some(rx);
        Some((Ok(to_event(frame)), next))
    })
}

fn to_event(frame: SseFrame) -> Event {
    let built = match frame {
        SseFrame::Progress(ev) => Event::default().event("progress").json_data(&ev),
        SseFrame::KeepAlive => return Event::default().comment("keep-alive"),
        SseFrame::Complete(done) => Event::default().event("complete").json_data(success_body(&done)),
        SseFrame::Error(message) => Event::default()
            .event("error")
            .json_data(json!({ "status": "error", "message": message })),
    };
    built.unwrap_or_else(|e| {
        error!(target: "api", error = %e, "failed to encode event");
        Event::default()
            .event("error")
            .data(r#"{"status":"error","message":"failed to encode event"}"#)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn frame_stream_ends_after_terminal_frame() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(SseFrame::KeepAlive).unwrap();
        tx.send(SseFrame::Error("boom".into())).unwrap();
        tx.send(SseFrame::KeepAlive).unwrap();

        // sender still alive: only the terminal frame can end the body
        let events: Vec<_> = frame_stream(rx).collect().await;
        assert_eq!(events.len(), 2);
        drop(tx);
    }

    #[test]
    fn failure_body_hides_detail_outside_dev() {
        let e = JobError::ProcessExit {
            code: Some(1),
            message: "boom".into(),
        };
        let mut cfg = BridgeConfig::default();
        cfg.dev_mode = false;
        let v = failure_body(&cfg, &e);
        assert_eq!(v["status"], "error");
        assert_eq!(v["message"], "Analysis failed: boom");
        assert!(v.get("error").is_none());

        cfg.dev_mode = true;
        assert!(failure_body(&cfg, &e)["error"].is_string());
    }
}
