//! WebSocket bridge between clients and the voice pipeline

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    middleware,
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ApiState, rate_limit};
use crate::voice::{Inbound, Outbound};

/// Frames buffered from the client before the coordinator reads them
const INBOUND_BUFFER: usize = 64;

/// Messages buffered for the client socket
const OUTBOUND_BUFFER: usize = 64;

/// Time allowed for the close frame to flush after teardown
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/audio", get(ws_upgrade))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::limit_connections,
        ))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Map a pipeline message onto a socket frame
fn to_frame(item: Outbound) -> crate::Result<Option<Message>> {
    Ok(match item {
        Outbound::Audio(bytes) => Some(Message::Binary(bytes)),
        Outbound::Close => Some(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "session ended".into(),
        }))),
        other => other.to_json()?.map(|text| Message::Text(text.into())),
    })
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<Inbound>(INBOUND_BUFFER);

    // Forward pipeline output to the socket until close
    let mut send_task = tokio::spawn(async move {
        while let Some(item) = out_rx.recv().await {
            let frame = match to_frame(item) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode outbound message");
                    continue;
                }
            };
            let closing = matches!(frame, Message::Close(_));
            if sender.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    // Feed client frames to the coordinator
    let recv_client = client_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let inbound = match msg {
                Message::Binary(data) => Inbound::Audio(data),
                Message::Text(text) => Inbound::Text(text.as_str().to_owned()),
                Message::Ping(data) => {
                    tracing::trace!(len = data.len(), "received ping");
                    continue;
                }
                Message::Close(_) => {
                    tracing::info!(client_id = %recv_client, "WebSocket closed by client");
                    break;
                }
                Message::Pong(_) => continue,
            };
            if in_tx.send(inbound).await.is_err() {
                return;
            }
        }
        let _ = in_tx.send(Inbound::Closed).await;
    });

    tracing::info!(client_id = %client_id, "WebSocket connected");

    let reason = state
        .coordinator
        .run(&client_id, ReceiverStream::new(in_rx), out_tx)
        .await;

    recv_task.abort();
    if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }

    tracing::info!(client_id = %client_id, reason = ?reason, "WebSocket disconnected");
}
