use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::Cache;

/// Short-lived tokens mapping to a user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// 8 uppercase hex chars, 15 minutes.
    Confirmation,
    /// 32 lowercase hex chars, 1 day.
    PasswordReset,
}

impl TokenKind {
    fn prefix(self) -> &'static str {
        match self {
            TokenKind::Confirmation => "confirm-user:",
            TokenKind::PasswordReset => "forgot-password:",
        }
    }

    pub fn ttl(self) -> Duration {
        match self {
            TokenKind::Confirmation => Duration::from_secs(15 * 60),
            TokenKind::PasswordReset => Duration::from_secs(24 * 60 * 60),
        }
    }

    fn generate(self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        match self {
            TokenKind::Confirmation => id[..8].to_uppercase(),
            TokenKind::PasswordReset => id,
        }
    }

    fn key(self, token: &str) -> String {
        format!("{}{}", self.prefix(), token)
    }
}

/// Issued tokens are independent: issuing a new one never invalidates an
/// older one, and resolving does not consume. Callers revoke after use.
#[derive(Clone)]
pub struct TokenStore {
    cache: Arc<dyn Cache>,
}

impl TokenStore {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn issue(&self, kind: TokenKind, user_id: Uuid) -> anyhow::Result<String> {
        let token = kind.generate();
        self.cache
            .set(&kind.key(&token), &user_id.to_string(), kind.ttl())
            .await?;
        debug!(?kind, %user_id, "token issued");
        Ok(token)
    }

    pub async fn resolve(&self, kind: TokenKind, token: &str) -> anyhow::Result<Option<Uuid>> {
        let Some(raw) = self.cache.get(&kind.key(token)).await? else {
            return Ok(None);
        };
        match Uuid::parse_str(&raw) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                warn!(?kind, error = %e, "token maps to a malformed user id");
                Ok(None)
            }
        }
    }

    pub async fn revoke(&self, kind: TokenKind, token: &str) -> anyhow::Result<()> {
        self.cache.del(&kind.key(token)).await
    }
}
