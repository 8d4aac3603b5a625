//! WebSocket transport for web terminals.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use termhub_core::SessionId;
use termhub_session::Session;

use crate::{
    context::AppContext,
    hub::HubSink,
    protocol::{ClientMessage, ServerMessage},
};

/// How long queued frames may take to flush once the socket is ending.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler for `/ws/{session_id}`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(ctx): State<AppContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, ctx))
}

async fn lookup(ctx: &AppContext, raw_id: &str) -> Option<Arc<Session>> {
    let id = raw_id.parse::<SessionId>().ok()?;
    ctx.registry().get(id).await
}

async fn send_direct(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = sender.send(Message::Text(json.into())).await;
        }
        Err(e) => tracing::error!("Failed to serialize message: {e}"),
    }
}

async fn handle_socket(socket: WebSocket, raw_id: String, ctx: AppContext) {
    let (mut sender, mut receiver) = socket.split();

    let Some(session) = lookup(&ctx, &raw_id).await else {
        tracing::warn!(session_id = %raw_id, "WebSocket for unknown session");
        send_direct(&mut sender, &ServerMessage::error("Session not found")).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    };
    let session_id = session.id();
    let hub = Arc::clone(ctx.hub());

    let (conn, mut rx) = hub.open_connection();
    let conn_id = conn.id();

    // Replay recent output before any live chunk reaches this connection.
    let history = session.history().snapshot();
    if !history.is_empty() {
        conn.send(ServerMessage::output(String::from_utf8_lossy(&history)));
    }
    let tx = conn.clone();
    hub.connect(session_id, conn, || {
        session.add_output_callback(Arc::new(HubSink::new(Arc::clone(&hub), session_id)))
    });

    // Forward queued messages to the socket. Ends once every sender is gone.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let closed = session.cancellation();
    loop {
        let msg = tokio::select! {
            () = closed.cancelled() => {
                tx.send(ServerMessage::error("Session closed"));
                break;
            }
            msg = receiver.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    tx.send(ServerMessage::error("Binary frames must be UTF-8 JSON"));
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(session_id = %session_id, "WebSocket error: {e}");
                break;
            }
        };

        match ClientMessage::parse(&text) {
            Ok(ClientMessage::Input { data }) => session.send_input(data.as_bytes()).await,
            Ok(ClientMessage::Resize { rows, cols }) => session.resize(rows, cols).await,
            Ok(ClientMessage::Ping) => {
                tx.send(ServerMessage::Pong);
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Invalid client message: {e}");
                tx.send(ServerMessage::error(format!("Invalid message: {e}")));
            }
        }
    }

    if let Some(sub) = hub.disconnect(session_id, conn_id) {
        session.remove_output_callback(sub);
    }

    drop(tx);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
}
