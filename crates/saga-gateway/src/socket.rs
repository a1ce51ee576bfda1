//! Websocket session: admission, then a writer task and a reader task.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use saga_core::GatewayError;
use tracing::{debug, trace};

use crate::connection::{ClientConnection, OutboundRx};
use crate::gateway::{CloseReason, Gateway};
use crate::protocol::ServerMessage;

/// Server-initiated websocket ping period.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long a closing socket may spend flushing its queue.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Close code sent when a connection is refused at admission.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
const CLOSE_NORMAL: u16 = 1000;

/// Drive one upgraded socket until either side goes away.
pub async fn handle_socket(socket: WebSocket, gateway: Gateway, origin: String) {
    let (conn, rx) = match gateway.connect(&origin) {
        Ok(admitted) => admitted,
        Err(err) => {
            reject(socket, &err).await;
            return;
        }
    };

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_tx, rx, Arc::clone(&conn)));

    let reader_conn = Arc::clone(&conn);
    let reader_gateway = gateway.clone();
    let mut reader = tokio::spawn(async move {
        let closed = reader_conn.closed_token();
        loop {
            let msg = tokio::select! {
                () = closed.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    reader_gateway.handle_text(&reader_conn, text.as_str());
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                    reader_gateway.heartbeat(&reader_conn);
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    let err = GatewayError::InvalidMessage("binary frames are not supported".into());
                    reader_conn.send_message(&ServerMessage::error(&err, None));
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(conn_id = %reader_conn.id, error = %e, "websocket read error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {
            // Let the writer flush whatever is queued, then close.
            conn.close();
            let _ = writer.await;
        }
    }

    gateway.disconnect(&conn.id, CloseReason::Client);
}

/// Forward queued frames to the socket and ping periodically. Once the
/// connection is closed, flush the queue (farewell included) and send a
/// close frame.
async fn write_loop(mut ws_tx: SplitSink<WebSocket, WsMessage>, mut rx: OutboundRx, conn: Arc<ClientConnection>) {
    let closed = conn.closed_token();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                let Some(frame) = msg else { break };
                if ws_tx.send(WsMessage::Text(frame.as_str().to_owned().into())).await.is_err() {
                    return;
                }
            }
            () = closed.cancelled() => break,
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(Default::default())).await.is_err() {
                    return;
                }
                trace!(conn_id = %conn.id, "sent ping");
            }
        }
    }

    let flush = async {
        while let Ok(frame) = rx.try_recv() {
            if ws_tx.send(WsMessage::Text(frame.as_str().to_owned().into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_NORMAL,
                reason: String::new().into(),
            })))
            .await;
    };
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await.is_err() {
        debug!(conn_id = %conn.id, "client stopped reading, close flush abandoned");
    }
}

/// Announce an admission rejection on the socket, then close it.
async fn reject(mut socket: WebSocket, err: &GatewayError) {
    if let Ok(frame) = ServerMessage::error(err, None).to_frame() {
        let _ = socket.send(WsMessage::Text(frame.to_string().into())).await;
    }
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: CLOSE_TRY_AGAIN_LATER,
            reason: err.error_kind().to_string().into(),
        })))
        .await;
}
