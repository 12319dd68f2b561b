//! WebSocket handler for terminal connections.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use classbox_protocol::{TerminalCommand, TerminalEvent};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::auth::CurrentUser;
use crate::terminal::{EventSender, TerminalError};

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Events buffered per connection before the bridge waits on the socket.
const EVENT_BUFFER: usize = 256;

/// How long queued events may take to flush when the server closes.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket upgrade handler.
///
/// GET /api/terminal
pub async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = user.id().to_string();
    info!("Terminal WebSocket upgrade request from user {}", user_id);
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, user_id))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (event_tx, mut event_rx) = mpsc::channel::<TerminalEvent>(EVENT_BUFFER);
    let closing = CancellationToken::new();

    let send_closing = closing.clone();
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.tick().await;

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    if send_event(&mut sender, &event).await.is_err() {
                        return;
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
                _ = send_closing.cancelled() => break,
            }
        }

        // Flush what is already queued, then close.
        while let Ok(event) = event_rx.try_recv() {
            if send_event(&mut sender, &event).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    info!(
        "Terminal connection {} opened for user {}",
        connection_id, user_id
    );

    while let Some(msg_result) = receiver.next().await {
        let result = match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<TerminalCommand>(text.as_str()) {
                Ok(cmd) => handle_command(&state, &connection_id, &user_id, cmd, &event_tx).await,
                Err(e) => {
                    warn!(
                        "Failed to parse command on terminal {}: {}",
                        connection_id, e
                    );
                    let _ = event_tx
                        .send(TerminalEvent::error(format!("invalid command: {}", e)))
                        .await;
                    Ok(())
                }
            },
            Ok(Message::Binary(data)) => state.terminals.input(&connection_id, &data).await,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(()),
            Ok(Message::Close(_)) => {
                debug!("Client closed terminal {}", connection_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error on terminal {}: {}", connection_id, e);
                break;
            }
        };

        if let Err(e) = result {
            warn!("Terminal {} command failed: {}", connection_id, e);
            let _ = event_tx.send(TerminalEvent::error(e.to_string())).await;
            if e.ends_connection() {
                break;
            }
        }
    }

    state
        .terminals
        .detach(&connection_id, "connection closed")
        .await;

    closing.cancel();
    let abort = send_task.abort_handle();
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, send_task)
        .await
        .is_err()
    {
        abort.abort();
    }
    info!(
        "Terminal connection {} closed for user {}",
        connection_id, user_id
    );
}

async fn send_event<S>(sender: &mut S, event: &TerminalEvent) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize terminal event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn handle_command(
    state: &AppState,
    connection_id: &str,
    user_id: &str,
    cmd: TerminalCommand,
    events: &EventSender,
) -> Result<(), TerminalError> {
    match cmd {
        TerminalCommand::Attach { project_id } => {
            state
                .terminals
                .attach(connection_id, user_id, &project_id, events.clone())
                .await
        }
        TerminalCommand::Input { data } => {
            state.terminals.input(connection_id, data.as_bytes()).await
        }
        TerminalCommand::Resize { rows, cols } => {
            state.terminals.resize(connection_id, rows, cols).await
        }
        TerminalCommand::Detach => {
            if !state.terminals.detach(connection_id, "detached").await {
                return Err(TerminalError::NoSession);
            }
            Ok(())
        }
    }
}
