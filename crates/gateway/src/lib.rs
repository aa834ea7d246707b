//! Gateway: WebSocket server, protocol dispatch, connection and
//! subscription registries.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Resolve the authenticator, bind address
//! 3. Start the HTTP server (health) and attach the WebSocket upgrade handler
//! 4. Bootstrap channels, apply config overrides
//! 5. Start the liveness heartbeat timer
//!
//! All state hangs off one [`state::GatewayState`] constructed at startup and
//! passed by reference into handlers; nothing is ambient.

pub mod auth;
pub mod broadcast;
pub mod events;
pub mod history;
pub mod liveness;
pub mod methods;
pub mod rate_limit;
pub mod server;
pub mod state;
pub mod stats;
pub mod subscriptions;
pub mod ws;
