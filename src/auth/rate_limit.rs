use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::cache::Cache;
use crate::errors::{AppError, RATE_LIMIT_EXCEEDED};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max: i64,
    /// Count only repeated calls carrying the same variables.
    pub limit_by_variables: bool,
    pub message: Option<&'static str>,
}

impl RateLimitPolicy {
    fn message(&self) -> &'static str {
        self.message.unwrap_or(RATE_LIMIT_EXCEEDED)
    }
}

/// Who a request is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    User(Uuid),
    Ip(IpAddr),
}

impl Identity {
    pub fn of(user_id: Option<Uuid>, ip: Option<IpAddr>) -> Option<Self> {
        user_id.map(Identity::User).or(ip.map(Identity::Ip))
    }

    fn key(&self) -> String {
        match self {
            Identity::User(id) => format!("user:{id}"),
            Identity::Ip(ip) => format!("ip:{ip}"),
        }
    }
}

/// Fixed-window counter in the cache. The first hit in a window creates
/// the counter with the window as expiry; later hits increment it.
#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn hit(
        &self,
        operation: &str,
        variables: Option<&serde_json::Value>,
        identity: Option<Identity>,
        policy: &RateLimitPolicy,
    ) -> Result<(), AppError> {
        let Some(identity) = identity else {
            return Ok(());
        };
        let key = limit_key(operation, variables.filter(|_| policy.limit_by_variables), &identity);

        match self.cache.get(&key).await? {
            Some(count) => {
                let count = count.parse::<i64>().unwrap_or(0);
                if count >= policy.max {
                    warn!(operation, identity = %identity.key(), "rate limit exceeded");
                    return Err(AppError::RateLimitExceeded(policy.message().to_string()));
                }
                self.cache.incr(&key).await?;
            }
            None => {
                self.cache.set(&key, "1", policy.window).await?;
            }
        }
        Ok(())
    }
}

fn limit_key(operation: &str, variables: Option<&serde_json::Value>, identity: &Identity) -> String {
    let mut parts = vec!["limit".to_string(), operation.to_string()];
    if let Some(vars) = variables {
        parts.push(normalize_variables(vars));
    }
    parts.push(identity.key());
    parts.join(":")
}

/// Serialized variables with everything but ASCII alphanumerics and commas
/// stripped.
pub fn normalize_variables(vars: &serde_json::Value) -> String {
    vars.to_string()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ',')
        .collect()
}
