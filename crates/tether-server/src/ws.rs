//! WebSocket upgrade and per-connection tasks.
//!
//! One read task and one write task per connection. The write task is
//! the sole consumer of the connection's outbound queue, so routed
//! frames to a peer never interleave mid-frame. Both tasks watch the
//! handle's cancellation token; every exit path funnels through
//! [`SessionCoordinator::device_disconnected`], which unregisters the
//! connection and ends dependent sessions.
//!
//! Identity resolution on upgrade: `?deviceId=...` for a known device,
//! or `?email=...&name=...&os=...` to go through the device directory
//! (one lookup, outside the signaling hot path).
//!
//! [`SessionCoordinator::device_disconnected`]: tether_signaling::SessionCoordinator::device_disconnected

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use tether_core::envelope::{Envelope, SignalMessage};
use tether_core::errors::SignalError;
use tether_core::ids::{ConnectionId, DeviceId};
use tether_signaling::{Outbound, PeerHandle};

use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::state::AppState;

/// Identity parameters on the upgrade request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Known device id.
    pub device_id: Option<String>,
    /// Owner email, for directory registration.
    pub email: Option<String>,
    /// Device display name, for directory registration.
    pub name: Option<String>,
    /// Device OS tag, for directory registration.
    pub os: Option<String>,
}

/// `GET /ws` — upgrade to the signaling channel.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let device_id = match resolve_device(&state, &query).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    ws.on_upgrade(move |socket| connection_task(state, device_id, socket))
}

/// Resolve the connecting device's identity, consulting the directory
/// when no device id is supplied.
async fn resolve_device(state: &AppState, query: &WsQuery) -> Result<DeviceId, Response> {
    if let Some(id) = &query.device_id {
        return Ok(DeviceId::new(id.clone()));
    }
    let (Some(email), Some(name)) = (&query.email, &query.name) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "supply deviceId, or email and name for registration",
        )
            .into_response());
    };
    let os = query.os.as_deref().unwrap_or("unknown");

    let user = match state.directory.find_or_create_user(email, email).await {
        Ok(user) => user,
        Err(e) => return Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()),
    };
    match state.directory.find_or_create_device(&user.id, name, os).await {
        Ok(device) => Ok(device.id),
        Err(e) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()),
    }
}

async fn connection_task(state: Arc<AppState>, device_id: DeviceId, socket: WebSocket) {
    let conn_id = ConnectionId::generate();
    let (tx, rx) = mpsc::channel(state.settings.outbound_queue_depth);
    let handle = Arc::new(PeerHandle::new(device_id.clone(), conn_id, tx));
    state.registry.register(Arc::clone(&handle));
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).set(state.registry.connection_count() as f64);
    info!(device = %device_id, conn = %conn_id, "websocket connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx, Arc::clone(&handle)));
    read_loop(&state, &handle, stream).await;

    state.coordinator.device_disconnected(&device_id, conn_id);
    let _ = writer.await;
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).set(state.registry.connection_count() as f64);
    info!(device = %device_id, conn = %conn_id, "websocket disconnected");
}

/// Drain the outbound queue into the socket. Sole writer for the
/// connection.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    handle: Arc<PeerHandle>,
) {
    let closed = handle.closed();
    loop {
        let item = tokio::select! {
            () = closed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            item = rx.recv() => item,
        };
        let message = match item {
            Some(Outbound::Frame(frame)) => Message::Text(frame.as_str().into()),
            Some(Outbound::Ping) => Message::Ping(Bytes::new()),
            None => break,
        };
        if sink.send(message).await.is_err() {
            handle.close();
            break;
        }
    }
}

/// Feed inbound frames through the coordinator until the socket or the
/// connection dies.
async fn read_loop(state: &AppState, handle: &Arc<PeerHandle>, mut stream: SplitStream<WebSocket>) {
    let closed = handle.closed();
    loop {
        let message = tokio::select! {
            () = closed.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                handle.touch();
                state.coordinator.handle_frame(handle.device_id(), text.as_str());
            }
            // Pings are answered by the transport; both directions count
            // as traffic for the idle clock.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => handle.touch(),
            Some(Ok(Message::Binary(_))) => {
                handle.touch();
                let error = SignalError::MalformedMessage(
                    "binary frames are not supported".to_string(),
                );
                let envelope = Envelope::now(SignalMessage::Error(error.to_payload()));
                if let Ok(frame) = serde_json::to_string(&envelope) {
                    let _ = handle.send_frame(Arc::new(frame));
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(device = %handle.device_id(), error = %e, "websocket read error");
                break;
            }
        }
    }
}
