use std::net::{IpAddr, SocketAddr};

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRef, FromRequestParts},
    http::{request::Parts, Extensions, HeaderMap},
};
use axum_extra::extract::cookie::CookieJar;

use crate::{
    auth::session::{Session, SessionStore, COOKIE_NAME},
    errors::AppError,
    state::AppState,
};

/// Per-request context handed to every operation: the session restored
/// from the `qid` cookie and the caller's address.
#[derive(Debug)]
pub struct RequestContext {
    pub session: Session,
    pub client_ip: Option<IpAddr>,
}

impl RequestContext {
    pub fn new(session: Session, client_ip: Option<IpAddr>) -> Self {
        Self { session, client_ip }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let session_id = jar.get(COOKIE_NAME).map(|c| c.value().to_string());
        let session = SessionStore::from_ref(state).load(session_id).await?;

        Ok(RequestContext::new(
            session,
            client_ip(&parts.headers, &parts.extensions, state.config.trust_proxy),
        ))
    }
}

/// Address of the caller. The socket peer unless `trust_proxy` is set, in
/// which case the last `X-Forwarded-For` hop (the one our proxy appended)
/// is used. Earlier hops are client-supplied and never read.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions, trust_proxy: bool) -> Option<IpAddr> {
    let forwarded = trust_proxy
        .then(|| headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.rsplit(',').next())
        .and_then(|last| last.trim().parse::<IpAddr>().ok());

    forwarded.or_else(|| {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    })
}
