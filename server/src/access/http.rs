//! HTTP middleware implementing TokenGate.

use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::OnceCell;

use filegate_core::tenant::Pnum;
use filegate_token::util::parse_authorization_header;
use filegate_token::Token;

use crate::access::Claims;
use crate::error::{ServerError, ServerResult};
use crate::{RequestState, State};

/// Auth state attached to a request once TokenGate has run.
#[derive(Debug)]
pub struct AuthState {
    pub claims: OnceCell<Claims>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            claims: OnceCell::new(),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.claims.get().map(Claims::user)
    }

    /// Returns the verified claims, or 401 if none were attached.
    pub fn require(&self) -> ServerResult<&Claims> {
        self.claims.get().ok_or(ServerError::AuthRejected)
    }
}

/// Extracts the tenant id from a `/v1/{pnum}/...` request path.
fn extract_pnum(path: &str) -> ServerResult<Pnum> {
    let mut segments = path.trim_start_matches('/').split('/');
    let version = segments.next().unwrap_or_default();
    if version != "v1" {
        return Err(ServerError::TenantInvalid);
    }
    let pnum = segments.next().ok_or(ServerError::TenantInvalid)?;
    Pnum::new(pnum).map_err(|_| ServerError::TenantInvalid)
}

/// Whether this path is the unauthenticated liveness check.
fn is_health_check(path: &str) -> bool {
    path.ends_with("/files/health")
}

/// TokenGate: `authorize(request) -> claims` or a 400/401 failure.
///
/// Role checks against a route's specific `roles_allowed` happen later, in
/// the handler, via [`Claims::require_any_role`].
pub async fn apply_auth<B>(req: Request<B>, next: Next<B>) -> Response {
    match apply_auth_inner(&req).await {
        Ok(Some(claims)) => {
            let req_state = req.extensions().get::<RequestState>().unwrap();
            req_state.auth.claims.set(claims).ok();
        }
        Ok(None) => {}
        Err(e) => return e.into_response(),
    }

    next.run(req).await
}

async fn apply_auth_inner<B>(req: &Request<B>) -> ServerResult<Option<Claims>> {
    let path = req.uri().path();
    if is_health_check(path) {
        return Ok(None);
    }

    let pnum = extract_pnum(path)?;

    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(ServerError::AuthMissing)?;
    let header_str = header.to_str().map_err(|_| ServerError::AuthMalformed)?;
    let jwt = parse_authorization_header(header_str).ok_or(ServerError::AuthMalformed)?;

    let state = req
        .extensions()
        .get::<State>()
        .cloned()
        .ok_or(ServerError::InternalServerError)?;

    let key = state
        .tenant_keys
        .get(&pnum)
        .map_err(|_| ServerError::InternalServerError)?;

    let token = match state.tenant_keys.algorithm() {
        jsonwebtoken::Algorithm::HS256 => Token::from_jwt_hs256(&jwt, &key),
        _ => Token::from_jwt_rs256(&jwt, &key),
    }
    .map_err(|e| {
        tracing::debug!(%e, "rejecting token");
        ServerError::AuthRejected
    })?;

    Ok(Some(Claims::from(&token)))
}
