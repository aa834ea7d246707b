use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    futures::{SinkExt, StreamExt},
    serde_json::json,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use opsgate_protocol::{ConnectParams, Frame, PROTOCOL_VERSION, close_codes};

use crate::{
    events::{Event, EventKind},
    methods,
    state::{ConnectedClient, GatewayState, Outbound},
};

/// Drive one accepted WebSocket connection from handshake to disconnect.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    addr: SocketAddr,
    mut params: ConnectParams,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Capacity is checked before the handshake is even inspected.
    if state.client_count().await >= state.config.max_connections {
        warn!(%addr, "gateway at capacity, rejecting connection");
        close(&mut ws_tx, close_codes::CAPACITY_EXCEEDED, "capacity exceeded").await;
        return;
    }

    let outcome = state
        .authenticator
        .authenticate(
            params.token.as_deref(),
            params.user_id.as_deref(),
            params.role.as_deref(),
        )
        .await;
    if !outcome.authenticated {
        warn!(
            %addr,
            reason = outcome.reason.as_deref().unwrap_or("denied"),
            "authentication failed"
        );
        close(&mut ws_tx, close_codes::AUTH_FAILED, "authentication failed").await;
        return;
    }
    params.user_id = outcome.user_id;
    params.role = outcome.role;

    let conn_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let client = ConnectedClient::new(&conn_id, params, addr.to_string(), tx.clone());

    // Registration re-checks capacity under the table's write lock.
    if !state.register_client(client).await {
        warn!(%addr, "gateway reached capacity during handshake");
        close(&mut ws_tx, close_codes::CAPACITY_EXCEEDED, "capacity exceeded").await;
        return;
    }
    state
        .record_event(
            Event::new(EventKind::Connection)
                .conn(&conn_id)
                .detail(addr.to_string()),
        )
        .await;
    info!(conn_id, %addr, "client connected");

    let welcome = Frame::notification(json!({
        "message": "connected",
        "connId": conn_id,
        "version": state.version,
        "protocol": PROTOCOL_VERSION,
    }));
    let _ = tx.send(Outbound::Frame(welcome.encode()));

    // Write loop: everything addressed to this client flows through one
    // queue, so responses and broadcasts are serialized onto the socket.
    let write_conn_id = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        debug!(conn_id = %write_conn_id, "write failed, stopping writer");
                        break;
                    }
                },
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                },
            }
        }
    });

    // Read loop: one dispatch per inbound text frame.
    'read: while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let replies = methods::dispatch(&state, &conn_id, text.as_str()).await;
                for frame in replies {
                    if tx.send(Outbound::Frame(frame.encode())).is_err() {
                        break 'read;
                    }
                }
            },
            Ok(Message::Close(_)) => {
                debug!(conn_id, "client closed connection");
                break;
            },
            // Transport-level ping/pong is answered by the server framework;
            // binary frames are not part of the protocol.
            Ok(_) => {},
            Err(e) => {
                debug!(conn_id, error = %e, "websocket error");
                break;
            },
        }
    }

    state.remove_client(&conn_id, "connection closed").await;
    writer.abort();
    info!(conn_id, %addr, "client disconnected");
}

async fn close(
    ws_tx: &mut futures::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) {
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
