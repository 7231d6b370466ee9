use crate::config::TransportSettings;
use crate::coordinator::{Coordinator, StatsReport, Submission};
use crate::error::CoordinationError;
use crate::status::RequestStatus;
use crate::transport::ws_handler;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bridge_core::protocol::DispatchPayload;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub settings: TransportSettings,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/api/generate", post(generate))
        .route("/api/requests/:request_id/status", get(request_status))
        .route("/api/stats", get(stats))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

fn error_status(err: &CoordinationError) -> StatusCode {
    match err {
        CoordinationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CoordinationError::NoWorkerAvailable { .. } | CoordinationError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoordinationError::RequestTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
        CoordinationError::DuplicateRequest { .. } => StatusCode::CONFLICT,
        CoordinationError::UnknownRequest { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &CoordinationError) -> Response {
    let body = json!({
        "error": err.to_string(),
        "code": err.code(),
        "requestId": err.request_id(),
    });
    (error_status(err), Json(body)).into_response()
}

pub async fn generate(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let payload: DispatchPayload = match serde_json::from_value(body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(event = "generate_invalid", error = %err);
            return error_response(&CoordinationError::InvalidRequest(err.to_string()));
        }
    };
    match state
        .coordinator
        .submit(Submission::from_payload(payload))
        .await
    {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "requestId": receipt.request_id,
                "correlationId": receipt.correlation_id,
                "workerId": receipt.worker_id,
            })),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn request_status(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestStatus>, Response> {
    state
        .coordinator
        .status(&request_id)
        .map(Json)
        .ok_or_else(|| error_response(&CoordinationError::UnknownRequest { request_id }))
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsReport> {
    Json(state.coordinator.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::connection::ConnectionHandle;
    use bridge_core::Capabilities;
    use tokio::sync::mpsc;

    fn state() -> AppState {
        AppState {
            coordinator: Coordinator::start(CoordinatorConfig::default()),
            settings: TransportSettings::default(),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn generate_maps_errors_to_status_codes() {
        let state = state();

        let response = generate(State(state.clone()), Json(json!({"model": "a"}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = generate(State(state.clone()), Json(json!({"prompt": ""}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = generate(
            State(state.clone()),
            Json(json!({"prompt": "cat", "requestId": "r1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["code"], "no_worker_available");
        assert_eq!(body["requestId"], "r1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accepted_request_is_visible_through_status_and_stats() {
        let state = state();
        let (tx, _rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(state.coordinator.next_conn_id(), tx);
        state
            .coordinator
            .connect_worker("w1", Capabilities::new(), handle)
            .await
            .expect("connect");

        let response = generate(
            State(state.clone()),
            Json(json!({"prompt": "cat", "requestId": "r1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["requestId"], "r1");
        assert!(body["correlationId"].as_str().is_some());

        let response = generate(
            State(state.clone()),
            Json(json!({"prompt": "cat", "requestId": "r1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let Json(status) = request_status(State(state.clone()), Path("r1".to_string()))
            .await
            .expect("status");
        assert_eq!(status.worker_id.as_deref(), Some("w1"));

        let missing = request_status(State(state.clone()), Path("nope".to_string())).await;
        match missing {
            Err(response) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            Ok(_) => panic!("unknown request must 404"),
        }

        let Json(report) = stats(State(state)).await;
        assert_eq!(report.health.connected, 1);
        assert_eq!(report.health.pending_requests, 1);
        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["errorRate"], 0.0);
        assert_eq!(value["health"]["connected"], 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn past_deadline_maps_to_request_timeout() {
        let state = state();
        let (tx, _rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(state.coordinator.next_conn_id(), tx);
        state
            .coordinator
            .connect_worker("w1", Capabilities::new(), handle)
            .await
            .expect("connect");
        let response = generate(
            State(state.clone()),
            Json(json!({"prompt": "cat", "timeoutMs": 0})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
