use std::sync::Arc;

use tracing::{debug, info};

use opsgate_protocol::{Frame, close_codes};

use crate::state::GatewayState;

/// One heartbeat sweep over all connections.
///
/// A client still flagged `awaiting_pong` from the previous tick has gone
/// silent for a full interval: it is closed and removed. Everyone else gets
/// the flag set and a ping frame. Together with the pong handler clearing
/// the flag, a dead connection is dropped within at most two intervals and
/// never sooner than one.
pub async fn tick(state: &Arc<GatewayState>) {
    let mut stale = Vec::new();
    {
        let mut clients = state.clients.write().await;
        for client in clients.values_mut() {
            if client.awaiting_pong {
                stale.push(client.conn_id.clone());
            } else {
                client.awaiting_pong = true;
                client.send_frame(&Frame::ping());
            }
        }
    }

    if !stale.is_empty() {
        debug!(count = stale.len(), "liveness sweep found stale connections");
    }
    for conn_id in stale {
        info!(conn_id, "liveness timeout, closing connection");
        if let Some(client) = state.clients.read().await.get(&conn_id) {
            client.close(close_codes::NORMAL, "liveness timeout");
        }
        state.remove_client(&conn_id, "liveness timeout").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use {
        opsgate_config::GatewaySection,
        opsgate_protocol::{ConnectParams, MessageType, decode, now_ms},
        serde_json::json,
    };

    use crate::{
        auth::resolve_authenticator,
        methods,
        state::{ConnectedClient, Outbound},
        subscriptions,
    };

    async fn state_with_client(conn_id: &str) -> (Arc<GatewayState>, UnboundedReceiver<Outbound>) {
        let state = GatewayState::new(GatewaySection::default(), resolve_authenticator(None));
        let (tx, rx) = mpsc::unbounded_channel();
        let params = ConnectParams {
            user_id: Some("u1".into()),
            role: Some("user".into()),
            ..Default::default()
        };
        let client = ConnectedClient::new(conn_id, params, "127.0.0.1:40000".into(), tx);
        assert!(state.register_client(client).await);
        (state, rx)
    }

    fn frames(rx: &mut UnboundedReceiver<Outbound>) -> (Vec<Frame>, Vec<(u16, String)>) {
        let mut out = Vec::new();
        let mut closes = Vec::new();
        while let Ok(item) = rx.try_recv() {
            match item {
                Outbound::Frame(text) => out.push(decode(&text).unwrap()),
                Outbound::Close { code, reason } => closes.push((code, reason)),
            }
        }
        (out, closes)
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_on_second_tick() {
        let (state, mut rx) = state_with_client("c1").await;
        subscriptions::subscribe(&state, "c1", "user", "notifications", None)
            .await
            .unwrap();

        tick(&state).await;
        assert_eq!(state.client_count().await, 1);
        let (sent, closes) = frames(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::Ping);
        assert!(closes.is_empty());

        tick(&state).await;
        assert_eq!(state.client_count().await, 0);
        assert_eq!(state.subscriptions.read().await.len(), 0);
        let (_, closes) = frames(&mut rx);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].1, "liveness timeout");
    }

    #[tokio::test]
    async fn pong_between_ticks_keeps_connection_alive() {
        let (state, mut rx) = state_with_client("c1").await;

        tick(&state).await;
        let pong = json!({"id": "p1", "type": "pong", "timestamp": now_ms()});
        methods::dispatch(&state, "c1", &pong.to_string()).await;

        tick(&state).await;
        assert_eq!(state.client_count().await, 1);
        // Two pings, no close.
        let (sent, closes) = frames(&mut rx);
        assert_eq!(sent.iter().filter(|f| f.kind == MessageType::Ping).count(), 2);
        assert!(closes.is_empty());
    }
}
