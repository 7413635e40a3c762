//! Admin replay endpoint: a single `axum` route in its own thin crate so
//! `tci-daemon::main` stays wiring-only and all routing lives here instead.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Serialize;
use tci_buffer::IngestionBuffer;
use tci_classify::classify;
use tci_schemas::PendingMessage;
use tracing::info;

pub struct AdminState {
    pub buffer: Arc<IngestionBuffer>,
}

pub fn build_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/admin/replay/hex", post(replay_hex))
        .with_state(state)
}

#[derive(Serialize)]
struct ReplayResponse {
    message: String,
}

/// `POST /admin/replay/hex`: hex-decodes the body and injects a
/// `PendingMessage` with offset sentinel `-1` and no ack-handle into the
/// buffer — offset commit is a no-op for replay injections.
async fn replay_hex(State(st): State<Arc<AdminState>>, body: String) -> Response {
    let raw_bytes = match hex::decode(body.trim()) {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(ReplayResponse {
                    message: "Invalid Hex".to_string(),
                }),
            )
                .into_response();
        }
    };

    let classified = classify(&raw_bytes);
    let msg = PendingMessage {
        classified: classified.into(),
        raw_bytes,
        offset: -1,
        ack_handle: None,
    };

    match st.buffer.try_enqueue(msg).await {
        Ok(()) => {
            info!("admin replay injected into buffer");
            (
                StatusCode::OK,
                axum::Json(ReplayResponse {
                    message: "Replay injected into buffer.".to_string(),
                }),
            )
                .into_response()
        }
        Err((_msg, _timeout)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(ReplayResponse {
                message: "buffer full, replay not injected".to_string(),
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn invalid_hex_is_rejected_before_touching_buffer() {
        let (buf, _rx) = IngestionBuffer::new(4, Duration::from_millis(50));
        let state = Arc::new(AdminState {
            buffer: Arc::new(buf),
        });

        let response = replay_hex(State(state), "not-hex!!".to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
