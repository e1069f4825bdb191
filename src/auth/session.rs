use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::MAX_SESSION_TTL_DAYS;

pub const COOKIE_NAME: &str = "qid";
const SESSION_PREFIX: &str = "sess:";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    user_id: Uuid,
}

/// What the request has to do with the cookie once the operation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieChange {
    None,
    Set,
    Clear,
}

/// Request-scoped session state. `user_id` being present means the
/// request is authenticated.
#[derive(Debug, Clone)]
pub struct Session {
    id: Option<String>,
    user_id: Option<Uuid>,
    cookie: CookieChange,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            id: None,
            user_id: None,
            cookie: CookieChange::None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    pub fn cookie_change(&self) -> CookieChange {
        self.cookie
    }
}

#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Restores the session referenced by a cookie id. Unknown or expired
    /// ids are dropped so a client can never choose its own session id.
    pub async fn load(&self, id: Option<String>) -> anyhow::Result<Session> {
        let Some(id) = id else {
            return Ok(Session::anonymous());
        };
        let user_id = match self.cache.get(&key(&id)).await? {
            Some(raw) => match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) => Some(record.user_id),
                Err(e) => {
                    warn!(error = %e, "discarding unreadable session record");
                    None
                }
            },
            None => None,
        };
        Ok(Session {
            id: user_id.map(|_| id),
            user_id,
            cookie: CookieChange::None,
        })
    }

    /// Marks the session as belonging to `user_id` and persists it. A session
    /// switching users gets a fresh id and the old record is dropped.
    pub async fn authenticate(&self, session: &mut Session, user_id: Uuid) -> anyhow::Result<()> {
        let id = match &session.id {
            Some(id) if session.user_id == Some(user_id) => id.clone(),
            Some(old) => {
                self.cache.del(&key(old)).await?;
                new_session_id()
            }
            None => new_session_id(),
        };
        let record = serde_json::to_string(&SessionRecord { user_id })
            .context("serialize session")?;
        self.cache.set(&key(&id), &record, self.ttl).await?;

        debug!(%user_id, "session authenticated");
        session.id = Some(id);
        session.user_id = Some(user_id);
        session.cookie = CookieChange::Set;
        Ok(())
    }

    pub async fn destroy(&self, session: &mut Session) -> anyhow::Result<()> {
        if let Some(id) = &session.id {
            self.cache.del(&key(id)).await?;
        }
        session.id = None;
        session.user_id = None;
        session.cookie = CookieChange::Clear;
        Ok(())
    }
}

/// Session lifetime for a configured number of days, clamped to
/// `1..=MAX_SESSION_TTL_DAYS`.
pub fn ttl_from_days(days: i64) -> Duration {
    let days = days.clamp(1, MAX_SESSION_TTL_DAYS).unsigned_abs();
    Duration::from_secs(days * 24 * 60 * 60)
}

fn key(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
