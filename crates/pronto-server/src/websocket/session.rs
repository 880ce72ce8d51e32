//! WebSocket session lifecycle: one authenticated client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use pronto_core::ids::ConnectionId;
use pronto_core::protocol::{CloseReason, ServerMessage};

use super::connection::{ClientConnection, Outbound};
use super::manager::WebSocketManager;
use crate::auth::AuthenticatedClient;

/// How long the writer gets to flush a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub(crate) fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Utf8Bytes::from_static(reason.as_str()),
    }))
}

/// Run a WebSocket session for an admitted client.
///
/// Inbound text frames are dispatched to the manager; outbound frames go
/// through the connection's bounded queue to a dedicated writer task, which
/// also sends the close frame once the connection is closed by the server.
#[instrument(skip_all, fields(conn_id = %conn_id, session_id = %client.session_id))]
pub async fn run_ws_session(
    socket: WebSocket,
    conn_id: ConnectionId,
    client: AuthenticatedClient,
    manager: Arc<WebSocketManager>,
    queue_depth: usize,
) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let connection = Arc::new(ClientConnection::new(
        conn_id.clone(),
        client.session_id,
        client.user_id,
        tx,
    ));
    let mut writer = tokio::spawn(write_loop(sink, rx, Arc::clone(&connection)));

    if manager.register_connection(Arc::clone(&connection)) {
        let closed = connection.closed();
        loop {
            let frame = tokio::select! {
                () = closed.cancelled() => break,
                frame = stream.next() => frame,
            };
            let Some(Ok(msg)) = frame else { break };
            match msg {
                Message::Text(text) => manager.handle_client_message(&connection, text.as_str()),
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => manager.handle_client_message(&connection, text),
                    Err(_) => {
                        let msg = ServerMessage::invalid_message("binary frame is not UTF-8");
                        connection.send_message(&msg);
                    }
                },
                Message::Ping(_) | Message::Pong(_) => connection.mark_alive(),
                Message::Close(_) => {
                    debug!("client sent close frame");
                    break;
                }
            }
        }
        manager.unregister_connection(&conn_id);
    }

    if connection.is_closing() {
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
    } else {
        writer.abort();
    }
    info!(
        age_ms = connection.age().as_millis() as u64,
        reason = connection.close_reason().map(CloseReason::as_str),
        "session ended"
    );
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    connection: Arc<ClientConnection>,
) {
    let closed = connection.closed();
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => {
                let reason = connection.close_reason().unwrap_or(CloseReason::ServerShutdown);
                let _ = sink.send(close_message(reason)).await;
                break;
            }
            frame = rx.recv() => {
                let msg = match frame {
                    Some(Outbound::Text(text)) => Message::Text(text.as_str().to_owned().into()),
                    Some(Outbound::Ping) => Message::Ping(Vec::new().into()),
                    None => break,
                };
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Upgrade-then-close for a client that failed admission. Browsers cannot
/// read an HTTP rejection on a failed handshake, so the reason travels in the
/// close frame.
pub async fn reject_socket(mut socket: WebSocket, reason: CloseReason) {
    if let Err(e) = socket.send(close_message(reason)).await {
        debug!(error = %e, reason = reason.as_str(), "failed to send rejection close frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_message_carries_code_and_reason() {
        let Message::Close(Some(frame)) = close_message(CloseReason::NotAuthorized) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1008);
        assert_eq!(frame.reason.as_str(), "NOT_AUTHORIZED");
    }

    #[test]
    fn shutdown_close_is_going_away() {
        let Message::Close(Some(frame)) = close_message(CloseReason::ServerShutdown) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1001);
    }
}
