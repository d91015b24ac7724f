//! HTTP surface: manual triggers and live progress.

use crate::orchestrator::{Trigger, TriggerHandle};
use crate::progress::{CycleSnapshot, ProgressEvent, ProgressPublisher};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<ProgressPublisher>,
    pub trigger: TriggerHandle,
    pub api_key: Option<String>,
    /// Ends open event streams on shutdown
    pub cancel: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/progress", get(progress))
        .route("/events", get(events))
        .route("/trigger", post(trigger))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `state.cancel` fires.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let cancel = state.cancel.clone();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("✓ HTTP server listening on port {}", port);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Constant-time string comparison for API keys
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn progress(State(state): State<AppState>) -> Json<CycleSnapshot> {
    Json(state.publisher.snapshot())
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Progress subscriber connected");
    Sse::new(event_stream(state.publisher.subscribe(), state.cancel.clone()))
        .keep_alive(KeepAlive::default())
}

/// Broadcast events as SSE frames until `cancel` fires. A subscriber that
/// falls behind skips the events it missed.
fn event_stream(
    receiver: broadcast::Receiver<ProgressEvent>,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let frame = match Event::default().json_data(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Failed to encode progress event: {}", e);
                            continue;
                        }
                    };
                    return Some((Ok(frame), receiver));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Progress subscriber lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .take_until(cancel.cancelled_owned())
}

async fn trigger(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(expected) = &state.api_key {
        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !constant_time_compare(provided, expected) {
            warn!("Rejected trigger request with invalid API key");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid API key" })),
            )
                .into_response();
        }
    }

    let queued = state.trigger.trigger(Trigger::Manual);
    info!("Manual trigger received (queued: {})", queued);
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": queued })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::trigger_channel;
    use crate::progress::Phase;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(api_key: Option<&str>) -> (AppState, tokio::sync::mpsc::Receiver<Trigger>) {
        let (trigger, receiver) = trigger_channel();
        let state = AppState {
            publisher: Arc::new(ProgressPublisher::default()),
            trigger,
            api_key: api_key.map(str::to_string),
            cancel: CancellationToken::new(),
        };
        (state, receiver)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("secret123", "secret123"));
        assert!(!constant_time_compare("secret123", "secret124"));
        assert!(!constant_time_compare("secret123", "secret12"));
        assert!(!constant_time_compare("", "secret"));
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _receiver) = state(None);
        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_trigger_requires_api_key() {
        let (state, mut receiver) = state(Some("secret"));
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::post("/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::post("/trigger")
                    .header(API_KEY_HEADER, "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(receiver.try_recv().is_err());

        let response = app
            .oneshot(
                Request::post("/trigger")
                    .header(API_KEY_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["queued"], true);
        assert_eq!(receiver.try_recv().ok(), Some(Trigger::Manual));
    }

    #[tokio::test]
    async fn test_trigger_coalesces_while_pending() {
        let (state, _receiver) = state(None);
        let app = router(state);

        let first = app
            .clone()
            .oneshot(Request::post("/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(first).await["queued"], true);

        let second = app
            .oneshot(Request::post("/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(second).await["queued"], false);
    }

    #[tokio::test]
    async fn test_progress_snapshot() {
        let (state, _receiver) = state(None);
        let publisher = state.publisher.clone();
        let cycle = publisher.begin_cycle();
        publisher.enter_phase(&cycle, Phase::Translate);

        let response = router(state)
            .oneshot(Request::get("/progress").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["cycle"], 1);
        assert_eq!(body["phase"], "Translate");
    }

    #[tokio::test]
    async fn test_events_content_type() {
        let (state, _receiver) = state(None);
        let response = router(state)
            .oneshot(Request::get("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }

    #[tokio::test]
    async fn test_event_stream_skips_lagged_events() {
        let publisher = ProgressPublisher::new(2);
        let stream = event_stream(publisher.subscribe(), CancellationToken::new());

        for _ in 0..5 {
            publisher.publish(ProgressEvent::NewCycle);
        }
        drop(publisher);

        let frames: Vec<_> = stream.collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_event_stream_ends_on_cancel() {
        let publisher = ProgressPublisher::default();
        let cancel = CancellationToken::new();
        let stream = event_stream(publisher.subscribe(), cancel.clone());

        publisher.publish(ProgressEvent::NewCycle);
        cancel.cancel();

        // The publisher is still alive; only the token ends the stream
        let frames = tokio::time::timeout(Duration::from_secs(3), stream.collect::<Vec<_>>())
            .await
            .expect("stream kept running after cancel");
        assert!(frames.len() <= 1);
        drop(publisher);
    }

    #[tokio::test]
    async fn test_serve_stops_with_open_event_stream() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (state, _receiver) = state(None);
        let cancel = state.cancel.clone();
        let server = tokio::spawn(serve(state, port));

        let url = format!("http://127.0.0.1:{}/events", port);
        let mut response = None;
        for _ in 0..50 {
            if let Ok(r) = reqwest::get(&url).await {
                response = Some(r);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let response = response.expect("server never came up");
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        cancel.cancel();
        let stopped = tokio::time::timeout(Duration::from_secs(3), server).await;
        assert!(matches!(stopped, Ok(Ok(Ok(())))));
        drop(response);
    }
}
