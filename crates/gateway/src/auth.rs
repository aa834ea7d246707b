use std::sync::Arc;

use async_trait::async_trait;

// ── Types ────────────────────────────────────────────────────────────────────

/// Result of an authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub reason: Option<String>,
}

impl AuthOutcome {
    pub fn granted(user_id: Option<String>, role: String) -> Self {
        Self {
            authenticated: true,
            user_id,
            role: Some(role),
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            user_id: None,
            role: None,
            reason: Some(reason.into()),
        }
    }
}

/// Seam to the external identity provider.
///
/// The gateway never defines roles; it only enforces channel permission
/// lists against the role string the provider hands back.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        token: Option<&str>,
        user_id: Option<&str>,
        role: Option<&str>,
    ) -> AuthOutcome;
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // XOR each byte and accumulate; any difference makes result non-zero.
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

// ── Built-in authenticator ───────────────────────────────────────────────────

/// Default authenticator used when no external provider is wired in.
///
/// A caller presenting neither token nor userId is rejected. When a shared
/// token is configured, the presented token must match it. The role is
/// passed through and defaults to "user".
pub struct GatewayAuthenticator {
    shared_token: Option<String>,
}

#[async_trait]
impl Authenticator for GatewayAuthenticator {
    async fn authenticate(
        &self,
        token: Option<&str>,
        user_id: Option<&str>,
        role: Option<&str>,
    ) -> AuthOutcome {
        if token.is_none() && user_id.is_none() {
            return AuthOutcome::denied("missing credentials");
        }
        if let Some(expected) = self.shared_token.as_deref() {
            let Some(given) = token else {
                return AuthOutcome::denied("token_missing");
            };
            if !safe_equal(given, expected) {
                return AuthOutcome::denied("token_mismatch");
            }
        }
        AuthOutcome::granted(
            user_id.map(str::to_string),
            role.unwrap_or("user").to_string(),
        )
    }
}

/// Resolve the authenticator from an optional shared token.
pub fn resolve_authenticator(shared_token: Option<String>) -> Arc<dyn Authenticator> {
    Arc::new(GatewayAuthenticator { shared_token })
}
