//! Bearer-token authentication middleware.
//!
//! A single shared secret gates every request. No per-IP rate limiting or
//! token rotation: the system this serves is a local daemon talked to by
//! one operator's own browser, not a multi-tenant service, so a
//! rate-limiter and hashed-token-file layer would be weight this surface
//! doesn't need to carry.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Holds the expected token. Cloned into every request's extension state.
#[derive(Clone)]
pub struct AuthState {
    token: String,
}

impl AuthState {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    fn verify(&self, provided: &str) -> bool {
        constant_time_eq(self.token.as_bytes(), provided.as_bytes())
    }
}

/// Byte-for-byte comparison that takes the same time regardless of where
/// the first mismatch falls, so a timing side-channel can't be used to
/// guess the token one byte at a time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub async fn bearer_auth_mw(
    State(auth): State<AuthState>,
    req: Request,
    next: Next,
) -> Response {
    match extract_bearer(req.headers()) {
        Some(token) if auth.verify(token) => next.run(req).await,
        _ => {
            warn!("rejected request with missing or invalid bearer token");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ")
}
