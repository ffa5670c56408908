use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::{SyncCoordinator, UploadCandidate, parse_order};
use crate::error::Error;
use crate::events::{OpResult, UploadResult};
use crate::slideshow::{SlideshowAction, SlideshowState};

/// Multipart field carrying uploaded files. May repeat.
const UPLOAD_FIELD: &str = "images";

#[derive(Clone)]
struct AppState {
    coordinator: Arc<SyncCoordinator>,
    queue_depth: usize,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub struct WebOptions {
    pub bind_address: SocketAddr,
    pub viewer_queue_depth: usize,
    pub max_upload_bytes: usize,
}

pub fn router(
    coordinator: Arc<SyncCoordinator>,
    options: &WebOptions,
    cancel: CancellationToken,
) -> Router {
    let state = AppState {
        coordinator,
        queue_depth: options.viewer_queue_depth,
        cancel,
    };
    Router::new()
        .route("/api/images", get(list_images))
        .route(
            "/api/images/upload",
            post(upload_images).layer(DefaultBodyLimit::max(options.max_upload_bytes)),
        )
        .route("/api/images/order", post(reorder_images))
        .route("/api/images/{id}", delete(delete_image))
        .route("/api/slideshow", get(slideshow_state).post(control_slideshow))
        .route("/api/config", get(read_settings).post(update_settings))
        .route("/ws", get(viewer_socket))
        .with_state(state)
}

pub fn spawn(
    coordinator: Arc<SyncCoordinator>,
    options: WebOptions,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let app = router(coordinator, &options, cancel.clone());
    let bind_addr = options.bind_address;
    tokio::spawn(async move {
        tracing::info!(%bind_addr, "starting kiosk web server");
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => {
                let shutdown = cancel.clone();
                if let Err(err) = axum::serve(listener, app.into_make_service())
                    .with_graceful_shutdown(async move {
                        shutdown.cancelled().await;
                    })
                    .await
                {
                    tracing::error!(error = %err, "kiosk web server failed");
                }
            }
            Err(err) => {
                tracing::error!(error = %err, %bind_addr, "failed to bind kiosk web server");
                cancel.cancel();
            }
        }
    })
}

async fn list_images(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.images())
}

async fn upload_images(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<UploadResult>>, (StatusCode, Json<OpResult>)> {
    let mut candidates = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(bad_request)?;
        candidates.push(UploadCandidate::new(name, bytes.to_vec()));
    }
    Ok(Json(state.coordinator.upload(candidates).await))
}

async fn delete_image(State(state): State<AppState>, Path(id): Path<String>) -> Json<OpResult> {
    Json(state.coordinator.delete(&id).await)
}

async fn reorder_images(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<OpResult>, (StatusCode, Json<OpResult>)> {
    let order = body
        .get("order")
        .ok_or_else(|| Error::validation("missing 'order'"))
        .and_then(parse_order)
        .map_err(bad_request)?;
    Ok(Json(state.coordinator.reorder(order).await))
}

async fn slideshow_state(State(state): State<AppState>) -> Json<SlideshowState> {
    Json(state.coordinator.slideshow_state().await)
}

async fn control_slideshow(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Json<SlideshowState> {
    let action = body
        .get("action")
        .and_then(Value::as_str)
        .map(SlideshowAction::parse)
        .unwrap_or(SlideshowAction::Unrecognized);
    Json(state.coordinator.control(action).await)
}

async fn read_settings(State(state): State<AppState>) -> Response {
    Json(state.coordinator.settings()).into_response()
}

async fn update_settings(State(state): State<AppState>, Json(patch): Json<Value>) -> Response {
    match state.coordinator.update_settings(patch).await {
        Ok(settings) => Json(settings).into_response(),
        Err(err @ Error::Validation(_)) => bad_request(err).into_response(),
        Err(err) => {
            warn!(error = %err, "settings update failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(OpResult::failed(err))).into_response()
        }
    }
}

async fn viewer_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| viewer_session(socket, state))
}

async fn viewer_session(socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(state.queue_depth);
    let id = match state.coordinator.connect(Arc::new(tx)).await {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "viewer could not take its initial snapshot");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    // The hub drops our sender when the queue overflows, which ends this loop.
    let forward = async {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    };
    // Viewers only listen; inbound frames are drained until the peer leaves.
    let inbound = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        _ = forward => debug!(channel = %id, "viewer queue closed"),
        _ = inbound => debug!(channel = %id, "viewer disconnected"),
        _ = state.cancel.cancelled() => debug!(channel = %id, "closing viewer for shutdown"),
    }
    state.coordinator.disconnect(id);
}

fn bad_request(err: impl ToString) -> (StatusCode, Json<OpResult>) {
    (StatusCode::BAD_REQUEST, Json(OpResult::failed(err)))
}
