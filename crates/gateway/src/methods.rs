use std::{sync::Arc, time::Instant};

use {
    serde_json::{Value, json},
    tracing::{debug, warn},
};

use opsgate_protocol::{
    ErrorShape, Frame, HISTORY_DEFAULT_LIMIT, MessageType, PROTOCOL_VERSION, decode, error_codes,
};

use crate::{
    broadcast,
    events::{Event, EventKind},
    state::GatewayState,
    subscriptions::{self, check_channel_access},
};

/// The result a frame handler produces.
pub type HandlerResult = Result<Value, ErrorShape>;

// ── Dispatch ─────────────────────────────────────────────────────────────────

/// Decode one inbound text payload and route it to its handler.
///
/// Returns the frames to send back to the acting connection. Every decoded
/// frame produces exactly one reply (success or error), except `pong`, which
/// answers the gateway's own heartbeat. Malformed payloads mutate nothing
/// and are answered with an `error` frame.
pub async fn dispatch(state: &Arc<GatewayState>, conn_id: &str, raw: &str) -> Vec<Frame> {
    let started = Instant::now();
    state.stats.record_in();

    if raw.len() > state.config.max_frame_bytes {
        warn!(conn_id, bytes = raw.len(), "oversized frame rejected");
        return vec![Frame::error(
            None,
            ErrorShape::new(
                error_codes::PROTOCOL_ERROR,
                format!("frame too large: {} bytes", raw.len()),
            ),
        )];
    }

    let frame = match decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(conn_id, error = %e, "frame rejected");
            state
                .record_event(Event::new(EventKind::Error).conn(conn_id).detail(e.to_string()))
                .await;
            return vec![Frame::error(
                None,
                ErrorShape::new(error_codes::PROTOCOL_ERROR, e.to_string()),
            )];
        },
    };

    if let Some(client) = state.clients.write().await.get_mut(conn_id) {
        client.touch();
    }

    let replies = match frame.kind {
        MessageType::Subscribe => reply(&frame, handle_subscribe(state, conn_id, &frame).await),
        MessageType::Unsubscribe => reply(&frame, handle_unsubscribe(state, conn_id, &frame).await),
        MessageType::Publish => reply(&frame, handle_publish(state, conn_id, &frame).await),
        MessageType::Request => reply(&frame, handle_request(state, conn_id, &frame).await),
        MessageType::GetChannels => reply(&frame, handle_get_channels(state, conn_id).await),
        MessageType::GetSubscriptions => {
            reply(&frame, handle_get_subscriptions(state, conn_id).await)
        },
        MessageType::GetHistory => reply(&frame, handle_get_history(state, conn_id, &frame).await),
        MessageType::Ping => vec![Frame::pong(&frame.id)],
        MessageType::Pong => {
            handle_pong(state, conn_id).await;
            Vec::new()
        },
        other => vec![Frame::error(
            Some(&frame.id),
            ErrorShape::new(
                error_codes::PROTOCOL_ERROR,
                format!("unsupported message type: {}", other.as_str()),
            ),
        )],
    };

    state
        .stats
        .record_dispatch_latency(started.elapsed().as_micros() as u64);
    replies
}

fn reply(frame: &Frame, result: HandlerResult) -> Vec<Frame> {
    match result {
        Ok(data) => vec![Frame::response(&frame.id, data)],
        Err(err) => {
            warn!(kind = frame.kind.as_str(), code = %err.code, msg = %err.message, "handler error");
            vec![Frame::error(Some(&frame.id), err)]
        },
    }
}

fn require_channel(frame: &Frame) -> Result<&str, ErrorShape> {
    frame
        .channel
        .as_deref()
        .ok_or_else(|| ErrorShape::new(error_codes::PROTOCOL_ERROR, "missing channel"))
}

async fn require_role(state: &GatewayState, conn_id: &str) -> Result<String, ErrorShape> {
    state
        .client_role(conn_id)
        .await
        .ok_or_else(|| ErrorShape::new(error_codes::INTERNAL_ERROR, "unknown connection"))
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn handle_subscribe(
    state: &Arc<GatewayState>,
    conn_id: &str,
    frame: &Frame,
) -> HandlerResult {
    let channel = require_channel(frame)?;
    let role = require_role(state, conn_id).await?;

    match subscriptions::subscribe(state, conn_id, &role, channel, frame.filters.clone()).await {
        Ok(sub) => {
            state
                .record_event(Event::new(EventKind::Subscription).conn(conn_id).channel(channel))
                .await;
            Ok(json!({
                "subscribed": true,
                "channel": channel,
                "subscriptionId": sub.id,
            }))
        },
        Err(err) => {
            if let Some(kind) = err.event_kind() {
                state
                    .record_event(Event::new(kind).conn(conn_id).channel(channel))
                    .await;
            }
            Err(err.to_shape())
        },
    }
}

async fn handle_unsubscribe(
    state: &Arc<GatewayState>,
    conn_id: &str,
    frame: &Frame,
) -> HandlerResult {
    let channel = require_channel(frame)?;
    let removed = state.subscriptions.write().await.remove(conn_id, channel);
    // Idempotent: the acknowledgement is the same whether or not anything was
    // removed; only an actual removal is logged.
    if removed.is_some() {
        state
            .record_event(Event::new(EventKind::Unsubscription).conn(conn_id).channel(channel))
            .await;
    }
    Ok(json!({ "unsubscribed": true, "channel": channel }))
}

async fn handle_publish(state: &Arc<GatewayState>, conn_id: &str, frame: &Frame) -> HandlerResult {
    let channel = require_channel(frame)?;
    let payload = frame
        .data
        .clone()
        .ok_or_else(|| ErrorShape::new(error_codes::PROTOCOL_ERROR, "missing data"))?;

    match broadcast::publish(state, Some(conn_id), channel, payload, MessageType::Message).await {
        Ok(outcome) => Ok(json!({
            "published": true,
            "channel": channel,
            "messageId": outcome.message_id,
            "recipients": outcome.delivered,
        })),
        Err(err) => {
            if let Some(kind) = err.event_kind() {
                state
                    .record_event(Event::new(kind).conn(conn_id).channel(channel))
                    .await;
            }
            Err(err.to_shape())
        },
    }
}

async fn handle_request(state: &Arc<GatewayState>, conn_id: &str, frame: &Frame) -> HandlerResult {
    let action = frame
        .data
        .as_ref()
        .and_then(|d| d.get("action"))
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorShape::new(error_codes::PROTOCOL_ERROR, "missing action"))?;

    match action {
        "status" => Ok(json!({
            "status": "ok",
            "version": state.version,
            "protocol": PROTOCOL_VERSION,
            "connections": state.client_count().await,
            "channels": state.channels.len(),
            "uptimeSecs": state.started_at.elapsed().as_secs(),
        })),
        "stats" => {
            let mut snapshot = state.stats.snapshot();
            if let Some(obj) = snapshot.as_object_mut() {
                obj.insert(
                    "subscriptions".into(),
                    json!(state.subscriptions.read().await.len()),
                );
                obj.insert("events".into(), json!(state.events.read().await.len()));
            }
            Ok(snapshot)
        },
        other => {
            debug!(conn_id, action = other, "unknown request action");
            Err(ErrorShape::new(
                error_codes::PROTOCOL_ERROR,
                format!("unknown request action: {other}"),
            ))
        },
    }
}

async fn handle_get_channels(state: &Arc<GatewayState>, conn_id: &str) -> HandlerResult {
    let role = require_role(state, conn_id).await?;
    let index = state.subscriptions.read().await;
    let channels: Vec<_> = state
        .channels
        .list()
        .into_iter()
        .filter(|c| c.allows_role(&role))
        .map(|c| {
            json!({
                "name": c.name,
                "description": c.description,
                "category": c.category,
                "subscribers": index.subscriber_count(&c.name),
                "maxSubscribers": c.max_subscribers,
                "messagesPerMinute": c.messages_per_minute,
                "messagesPerHour": c.messages_per_hour,
                "active": c.active,
            })
        })
        .collect();
    Ok(json!({ "channels": channels }))
}

async fn handle_get_subscriptions(state: &Arc<GatewayState>, conn_id: &str) -> HandlerResult {
    let index = state.subscriptions.read().await;
    let subs: Vec<_> = index
        .for_conn(conn_id)
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "channel": s.channel,
                "filters": s.filters,
                "createdAt": s.created_at,
                "lastMessage": s.last_message,
                "delivered": s.delivered,
            })
        })
        .collect();
    Ok(json!({ "subscriptions": subs }))
}

async fn handle_get_history(
    state: &Arc<GatewayState>,
    conn_id: &str,
    frame: &Frame,
) -> HandlerResult {
    let data = frame.data.as_ref();
    let channel = data
        .and_then(|d| d.get("channel"))
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorShape::new(error_codes::PROTOCOL_ERROR, "missing data.channel"))?;
    let limit = data
        .and_then(|d| d.get("limit"))
        .and_then(Value::as_u64)
        .map(|l| l as usize)
        .unwrap_or(HISTORY_DEFAULT_LIMIT);

    // Same access rules as subscribe.
    let role = require_role(state, conn_id).await?;
    check_channel_access(&state.channels, channel, &role).map_err(|e| e.to_shape())?;

    let messages = state.history.read().await.recent(channel, limit);
    Ok(json!({ "channel": channel, "messages": messages }))
}

async fn handle_pong(state: &Arc<GatewayState>, conn_id: &str) {
    if let Some(client) = state.clients.write().await.get_mut(conn_id) {
        client.awaiting_pong = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use {
        opsgate_config::GatewaySection,
        opsgate_protocol::{ConnectParams, now_ms},
    };

    use crate::{
        auth::resolve_authenticator,
        state::{ConnectedClient, Outbound},
    };

    async fn test_state() -> Arc<GatewayState> {
        GatewayState::new(GatewaySection::default(), resolve_authenticator(None))
    }

    async fn connect(
        state: &Arc<GatewayState>,
        conn_id: &str,
        role: &str,
    ) -> UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let params = ConnectParams {
            user_id: Some(format!("{conn_id}-user")),
            role: Some(role.into()),
            ..Default::default()
        };
        let client = ConnectedClient::new(conn_id, params, "127.0.0.1:40000".into(), tx);
        assert!(state.register_client(client).await);
        rx
    }

    fn raw(kind: &str, channel: Option<&str>, data: Option<Value>) -> String {
        let mut frame = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "type": kind,
            "timestamp": now_ms(),
        });
        if let Some(c) = channel {
            frame["channel"] = json!(c);
        }
        if let Some(d) = data {
            frame["data"] = d;
        }
        frame.to_string()
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Frame(text) = out {
                frames.push(decode(&text).unwrap());
            }
        }
        frames
    }

    fn error_code(frame: &Frame) -> &str {
        frame.data.as_ref().unwrap()["code"].as_str().unwrap()
    }

    #[tokio::test]
    async fn subscribe_acknowledges_with_channel() {
        // Scenario: role "user" subscribing to a user-visible channel.
        let state = test_state().await;
        let _rx = connect(&state, "c1", "user").await;

        let replies = dispatch(&state, "c1", &raw("subscribe", Some("notifications"), None)).await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageType::Response);
        let data = replies[0].data.as_ref().unwrap();
        assert_eq!(data["subscribed"], true);
        assert_eq!(data["channel"], "notifications");
        assert_eq!(state.subscriptions.read().await.len(), 1);
        assert_eq!(
            state
                .events
                .read()
                .await
                .count_kind(EventKind::Subscription),
            1
        );
    }

    #[tokio::test]
    async fn subscribe_admin_channel_as_user_is_denied() {
        let state = test_state().await;
        let _rx = connect(&state, "c1", "user").await;

        let replies = dispatch(&state, "c1", &raw("subscribe", Some("logs"), None)).await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageType::Error);
        let data = replies[0].data.as_ref().unwrap();
        assert_eq!(data["code"], "permission_denied");
        assert_eq!(data["message"], "Permission denied for channel: logs");
        assert_eq!(state.subscriptions.read().await.len(), 0);
        assert_eq!(
            state
                .events
                .read()
                .await
                .count_kind(EventKind::PermissionDenied),
            1
        );
    }

    #[tokio::test]
    async fn publish_hits_minute_budget_on_twenty_first() {
        // backups is configured at 20 messages per minute.
        let state = test_state().await;
        let _rx = connect(&state, "c1", "admin").await;

        for i in 0..20 {
            let replies = dispatch(
                &state,
                "c1",
                &raw("publish", Some("backups"), Some(json!({"seq": i}))),
            )
            .await;
            assert_eq!(replies[0].kind, MessageType::Response, "publish {i} failed");
        }

        let replies = dispatch(
            &state,
            "c1",
            &raw("publish", Some("backups"), Some(json!({"seq": 20}))),
        )
        .await;
        assert_eq!(replies[0].kind, MessageType::Error);
        assert_eq!(error_code(&replies[0]), "rate_limited");

        // All twenty accepted publishes are retained, in order.
        let history = state.history.read().await.recent("backups", 50);
        assert_eq!(history.len(), 20);
        let seqs: Vec<_> = history
            .iter()
            .map(|f| f.data.as_ref().unwrap()["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
        assert_eq!(
            state.events.read().await.count_kind(EventKind::RateLimited),
            1
        );
    }

    #[tokio::test]
    async fn publish_delivers_to_matching_filters_only() {
        let state = test_state().await;
        let mut rx_us = connect(&state, "c1", "user").await;
        let mut rx_eu = connect(&state, "c2", "user").await;
        let _rx_pub = connect(&state, "c3", "user").await;

        let sub_us = json!({
            "id": "s1", "type": "subscribe", "channel": "metrics",
            "timestamp": now_ms(), "filters": {"region": "us"},
        });
        let sub_eu = json!({
            "id": "s2", "type": "subscribe", "channel": "metrics",
            "timestamp": now_ms(), "filters": {"region": "eu"},
        });
        dispatch(&state, "c1", &sub_us.to_string()).await;
        dispatch(&state, "c2", &sub_eu.to_string()).await;

        let replies = dispatch(
            &state,
            "c3",
            &raw(
                "publish",
                Some("metrics"),
                Some(json!({"region": "us", "value": 1})),
            ),
        )
        .await;

        let ack = replies[0].data.as_ref().unwrap();
        assert_eq!(ack["recipients"], 1);
        let us_frames = drain(&mut rx_us);
        assert_eq!(us_frames.len(), 1);
        assert_eq!(us_frames[0].kind, MessageType::Message);
        assert_eq!(us_frames[0].from.as_deref(), Some("c3"));
        assert!(drain(&mut rx_eu).is_empty());
    }

    #[tokio::test]
    async fn ping_yields_one_pong_with_correlation() {
        let state = test_state().await;
        let _rx = connect(&state, "c1", "user").await;

        let ping = json!({"id": "ping-7", "type": "ping", "timestamp": now_ms()});
        let replies = dispatch(&state, "c1", &ping.to_string()).await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageType::Pong);
        assert_eq!(replies[0].response_to.as_deref(), Some("ping-7"));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let state = test_state().await;
        let _rx = connect(&state, "c1", "user").await;
        dispatch(&state, "c1", &raw("subscribe", Some("notifications"), None)).await;

        let first = dispatch(&state, "c1", &raw("unsubscribe", Some("notifications"), None)).await;
        let second = dispatch(&state, "c1", &raw("unsubscribe", Some("notifications"), None)).await;

        for replies in [&first, &second] {
            assert_eq!(replies[0].kind, MessageType::Response);
            let data = replies[0].data.as_ref().unwrap();
            assert_eq!(data["unsubscribed"], true);
            assert_eq!(data["channel"], "notifications");
        }
        // Only the removal that actually happened was logged.
        assert_eq!(
            state
                .events
                .read()
                .await
                .count_kind(EventKind::Unsubscription),
            1
        );
    }

    #[tokio::test]
    async fn malformed_frames_mutate_nothing() {
        let state = test_state().await;
        let _rx = connect(&state, "c1", "user").await;

        for bad in ["not json", "[1,2]", r#"{"type":"subscribe"}"#] {
            let replies = dispatch(&state, "c1", bad).await;
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].kind, MessageType::Error);
            assert_eq!(error_code(&replies[0]), "protocol_error");
        }
        assert_eq!(state.subscriptions.read().await.len(), 0);
        assert_eq!(state.client_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_type_is_named_in_error() {
        let state = test_state().await;
        let _rx = connect(&state, "c1", "user").await;

        let bad = json!({"id": "x", "type": "teleport", "timestamp": now_ms()});
        let replies = dispatch(&state, "c1", &bad.to_string()).await;

        let message = replies[0].data.as_ref().unwrap()["message"].as_str().unwrap();
        assert!(message.contains("teleport"), "got: {message}");
    }

    #[tokio::test]
    async fn inbound_delivery_types_are_not_dispatchable() {
        let state = test_state().await;
        let _rx = connect(&state, "c1", "user").await;

        let replies = dispatch(
            &state,
            "c1",
            &raw("notification", None, Some(json!({"x": 1}))),
        )
        .await;
        assert_eq!(replies[0].kind, MessageType::Error);
        let message = replies[0].data.as_ref().unwrap()["message"].as_str().unwrap();
        assert!(message.contains("notification"));
    }

    #[tokio::test]
    async fn get_channels_is_scoped_to_role() {
        let state = test_state().await;
        let _rx1 = connect(&state, "c1", "user").await;
        let _rx2 = connect(&state, "c2", "admin").await;
        dispatch(&state, "c1", &raw("subscribe", Some("metrics"), None)).await;

        let user_reply = dispatch(&state, "c1", &raw("get_channels", None, None)).await;
        let channels = user_reply[0].data.as_ref().unwrap()["channels"]
            .as_array()
            .unwrap()
            .clone();
        // logs and backups are admin-only.
        assert_eq!(channels.len(), 3);
        let metrics = channels
            .iter()
            .find(|c| c["name"] == "metrics")
            .unwrap();
        assert_eq!(metrics["subscribers"], 1);

        let admin_reply = dispatch(&state, "c2", &raw("get_channels", None, None)).await;
        let all = admin_reply[0].data.as_ref().unwrap()["channels"]
            .as_array()
            .unwrap()
            .len();
        assert_eq!(all, 5);
    }

    #[tokio::test]
    async fn get_subscriptions_lists_only_own() {
        let state = test_state().await;
        let _rx1 = connect(&state, "c1", "user").await;
        let _rx2 = connect(&state, "c2", "user").await;
        dispatch(&state, "c1", &raw("subscribe", Some("metrics"), None)).await;
        dispatch(&state, "c1", &raw("subscribe", Some("notifications"), None)).await;
        dispatch(&state, "c2", &raw("subscribe", Some("metrics"), None)).await;

        let replies = dispatch(&state, "c1", &raw("get_subscriptions", None, None)).await;
        let subs = replies[0].data.as_ref().unwrap()["subscriptions"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(subs.len(), 2);
        let channels: Vec<_> = subs.iter().map(|s| s["channel"].as_str().unwrap()).collect();
        assert_eq!(channels, vec!["metrics", "notifications"]);
    }

    #[tokio::test]
    async fn get_history_returns_tail_with_permission_check() {
        let state = test_state().await;
        let _admin = connect(&state, "c1", "admin").await;
        let _user = connect(&state, "c2", "user").await;
        for i in 0..5 {
            dispatch(
                &state,
                "c1",
                &raw("publish", Some("backups"), Some(json!({"seq": i}))),
            )
            .await;
        }

        let replies = dispatch(
            &state,
            "c1",
            &raw("get_history", None, Some(json!({"channel": "backups", "limit": 2}))),
        )
        .await;
        let messages = replies[0].data.as_ref().unwrap()["messages"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["data"]["seq"], 3);
        assert_eq!(messages[1]["data"]["seq"], 4);

        // History access follows the same permission rules as subscribe.
        let denied = dispatch(
            &state,
            "c2",
            &raw("get_history", None, Some(json!({"channel": "backups"}))),
        )
        .await;
        assert_eq!(denied[0].kind, MessageType::Error);
        assert_eq!(error_code(&denied[0]), "permission_denied");

        // data.channel is required.
        let missing = dispatch(&state, "c1", &raw("get_history", None, Some(json!({})))).await;
        assert_eq!(error_code(&missing[0]), "protocol_error");
    }

    #[tokio::test]
    async fn channel_capacity_is_never_overshot() {
        let state = test_state().await;
        state
            .channels
            .apply_override("notifications", |c| c.max_subscribers = 1);
        let _rx1 = connect(&state, "c1", "user").await;
        let _rx2 = connect(&state, "c2", "user").await;

        let first = dispatch(&state, "c1", &raw("subscribe", Some("notifications"), None)).await;
        assert_eq!(first[0].kind, MessageType::Response);
        let second = dispatch(&state, "c2", &raw("subscribe", Some("notifications"), None)).await;
        assert_eq!(second[0].kind, MessageType::Error);
        assert_eq!(error_code(&second[0]), "capacity_exceeded");
        assert_eq!(
            state
                .subscriptions
                .read()
                .await
                .subscriber_count("notifications"),
            1
        );

        // Re-subscribing from the same connection is a replace, not an add.
        let again = dispatch(&state, "c1", &raw("subscribe", Some("notifications"), None)).await;
        assert_eq!(again[0].kind, MessageType::Response);
    }

    #[tokio::test]
    async fn request_status_and_stats() {
        let state = test_state().await;
        let _rx = connect(&state, "c1", "user").await;

        let status = dispatch(
            &state,
            "c1",
            &raw("request", None, Some(json!({"action": "status"}))),
        )
        .await;
        let data = status[0].data.as_ref().unwrap();
        assert_eq!(data["status"], "ok");
        assert_eq!(data["connections"], 1);
        assert_eq!(data["channels"], 5);

        let stats = dispatch(
            &state,
            "c1",
            &raw("request", None, Some(json!({"action": "stats"}))),
        )
        .await;
        let data = stats[0].data.as_ref().unwrap();
        assert!(data["messagesIn"].as_u64().unwrap() >= 2);

        let unknown = dispatch(
            &state,
            "c1",
            &raw("request", None, Some(json!({"action": "reboot"}))),
        )
        .await;
        let message = unknown[0].data.as_ref().unwrap()["message"].as_str().unwrap();
        assert!(message.contains("reboot"));
    }

    #[tokio::test]
    async fn pong_clears_heartbeat_flag_without_reply() {
        let state = test_state().await;
        let _rx = connect(&state, "c1", "user").await;
        state
            .clients
            .write()
            .await
            .get_mut("c1")
            .unwrap()
            .awaiting_pong = true;

        let replies = dispatch(&state, "c1", &raw("pong", None, None)).await;

        assert!(replies.is_empty());
        assert!(!state.clients.read().await.get("c1").unwrap().awaiting_pong);
    }
}
