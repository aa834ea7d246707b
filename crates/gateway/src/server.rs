use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, Query, State, WebSocketUpgrade},
        http::{HeaderMap, header::USER_AGENT},
        response::{IntoResponse, Json},
        routing::get,
    },
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use {
    opsgate_config::{ChannelOverride, GatewaySection},
    opsgate_protocol::{ConnectParams, PROTOCOL_VERSION},
};

use crate::{auth, liveness, state::GatewayState, ws::handle_connection};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(cors)
        .with_state(AppState { gateway: state })
}

/// Apply per-channel config overrides to a bootstrap registry.
pub fn apply_channel_overrides(
    registry: &opsgate_channels::ChannelRegistry,
    overrides: &[ChannelOverride],
) {
    for o in overrides {
        let applied = registry.apply_override(&o.name, |c| {
            if let Some(v) = o.messages_per_minute {
                c.messages_per_minute = v;
            }
            if let Some(v) = o.messages_per_hour {
                c.messages_per_hour = v;
            }
            if let Some(v) = o.max_subscribers {
                c.max_subscribers = v;
            }
            if let Some(v) = &o.permissions {
                c.permissions = v.clone();
            }
            if let Some(v) = o.active {
                c.active = v;
            }
        });
        if !applied {
            tracing::warn!(channel = %o.name, "config override for unknown channel ignored");
        }
    }
}

/// Start the gateway HTTP + WebSocket server.
///
/// The only fatal error is failing to bind the listener; everything after
/// that is handled per-connection.
pub async fn start_gateway(bind: &str, port: u16) -> anyhow::Result<()> {
    // Resolve the shared token from environment (OPSGATE_TOKEN) or config.
    let config = opsgate_config::discover_and_load();
    let token = std::env::var("OPSGATE_TOKEN")
        .ok()
        .or_else(|| config.gateway.token.clone());
    let authenticator = auth::resolve_authenticator(token);

    let section = GatewaySection {
        bind: bind.to_string(),
        port,
        ..config.gateway.clone()
    };
    let heartbeat_secs = section.heartbeat_interval_secs;
    let state = GatewayState::new(section, authenticator);
    apply_channel_overrides(&state.channels, &config.channels);

    let app = build_gateway_app(Arc::clone(&state));

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("opsgate gateway v{}", state.version),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!("{} channels registered", state.channels.len()),
        format!("heartbeat every {heartbeat_secs}s"),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    // Spawn the liveness heartbeat.
    let tick_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(heartbeat_secs.max(1)));
        loop {
            interval.tick().await;
            liveness::tick(&tick_state).await;
        }
    });

    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = &state.gateway;
    Json(serde_json::json!({
        "status": "ok",
        "version": gateway.version,
        "protocol": PROTOCOL_VERSION,
        "connections": gateway.client_count().await,
        "channels": gateway.channels.len(),
        "uptimeSecs": gateway.started_at.elapsed().as_secs(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(mut params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if params.user_agent.is_none() {
        params.user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state.gateway, addr, params))
}
