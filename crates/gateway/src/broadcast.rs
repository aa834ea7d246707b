use {
    serde_json::Value,
    tracing::{debug, warn},
};

use opsgate_protocol::{Frame, MessageType};

use crate::{
    state::GatewayState,
    subscriptions::{AccessError, check_channel_access, lookup_active},
};

/// Result of one publish, reported back to the sender.
#[derive(Debug)]
pub struct PublishOutcome {
    pub message_id: String,
    pub delivered: usize,
}

/// Publish a payload to a channel and fan it out to current subscribers.
///
/// Validation order matches subscribe: existence, activity, permission,
/// sender rate budget. Only then is the message stamped, retained, and
/// delivered — validate-then-mutate, nothing to roll back on failure.
///
/// Fan-out is best effort per subscriber: closed transports, filter
/// mismatches, exhausted recipient budgets, and write failures each skip
/// that one recipient and never abort the rest. The sender gets an ack
/// regardless of how many recipients were reached.
pub async fn publish(
    state: &GatewayState,
    sender: Option<&str>,
    channel_name: &str,
    payload: Value,
    kind: MessageType,
) -> Result<PublishOutcome, AccessError> {
    let channel = match sender {
        Some(conn_id) => {
            let role = state
                .client_role(conn_id)
                .await
                .unwrap_or_else(|| "user".to_string());
            check_channel_access(&state.channels, channel_name, &role)?
        },
        // System-originated publishes have no sender connection; only
        // existence and activity apply.
        None => lookup_active(&state.channels, channel_name)?,
    };

    if let Some(conn_id) = sender {
        if !state.rate_limiter.check_and_consume(
            conn_id,
            channel_name,
            channel.messages_per_minute,
            channel.messages_per_hour,
        ) {
            return Err(AccessError::RateLimited(channel_name.to_string()));
        }
    }

    let frame = Frame::channel_message(kind, channel_name, payload, sender);
    state.history.write().await.append(frame.clone());

    let mut delivered = 0;
    {
        // Lock order: clients before subscriptions. Holding both for the
        // fan-out keeps delivery atomic w.r.t. disconnects: a half-removed
        // connection can never be selected as a recipient.
        let clients = state.clients.read().await;
        let mut index = state.subscriptions.write().await;
        if let Some(subs) = index.channel_mut(channel_name) {
            for sub in subs.values_mut() {
                let Some(client) = clients.get(&sub.conn_id) else {
                    continue;
                };
                if !sub.matches(frame.data.as_ref()) {
                    continue;
                }
                // Each recipient spends from its own budget for the channel.
                if !state.rate_limiter.check_and_consume(
                    &sub.conn_id,
                    channel_name,
                    channel.messages_per_minute,
                    channel.messages_per_hour,
                ) {
                    debug!(conn_id = %sub.conn_id, channel_name, "recipient rate limited, skipping");
                    continue;
                }
                if client.send_frame(&frame) {
                    sub.delivered += 1;
                    sub.last_message = Some(frame.timestamp);
                    state.stats.record_out();
                    delivered += 1;
                } else {
                    warn!(conn_id = %sub.conn_id, channel_name, "delivery failed, skipping recipient");
                    state.stats.record_delivery_failure();
                }
            }
        }
    }
    state.stats.record_broadcast();

    debug!(channel_name, delivered, message_id = %frame.id, "published");
    Ok(PublishOutcome {
        message_id: frame.id,
        delivered,
    })
}

// ── System-side publish wrappers ─────────────────────────────────────────────
//
// Thin entry points for provisioning and monitoring subsystems. Each targets
// a fixed channel with its category type; recipient-side filtering and rate
// budgets still apply.

pub async fn send_system_notification(
    state: &GatewayState,
    payload: Value,
) -> Result<PublishOutcome, AccessError> {
    publish(state, None, "system", payload, MessageType::System).await
}

pub async fn send_log_message(
    state: &GatewayState,
    payload: Value,
) -> Result<PublishOutcome, AccessError> {
    publish(state, None, "logs", payload, MessageType::Log).await
}

pub async fn send_metrics(
    state: &GatewayState,
    payload: Value,
) -> Result<PublishOutcome, AccessError> {
    publish(state, None, "metrics", payload, MessageType::Metrics).await
}

pub async fn send_backup_status(
    state: &GatewayState,
    payload: Value,
) -> Result<PublishOutcome, AccessError> {
    publish(state, None, "backups", payload, MessageType::Backup).await
}
