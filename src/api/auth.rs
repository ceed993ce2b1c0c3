// Bearer-token authentication
//
// Auth is active only when an operator password hash is configured.
// /auth/login trades the password for a random bearer token with a
// bounded lifetime; only the token's SHA-256 is kept server-side.
// WebSocket and SSE clients cannot always set headers, so a ?token=
// query parameter is accepted there as well.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::error::{ApiError, ApiResult};
use super::ApiState;
use crate::error::Error;

pub struct AuthState {
    /// token digest -> expiry
    tokens: Mutex<HashMap<String, Instant>>,
}

fn digest(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a bearer token valid for `ttl`.
    pub fn issue(&self, ttl: Duration) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token: String = raw.iter().map(|b| format!("{b:02x}")).collect();

        let mut tokens = self.tokens.lock().expect("token lock poisoned");
        // Expired entries can pile up on a long-lived appliance
        tokens.retain(|_, expiry| *expiry > Instant::now());
        tokens.insert(digest(&token), Instant::now() + ttl);
        token
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .expect("token lock poisoned")
            .remove(&digest(token))
            .is_some()
    }

    pub fn verify(&self, token: &str) -> bool {
        let tokens = self.tokens.lock().expect("token lock poisoned");
        tokens
            .get(&digest(token))
            .map(|expiry| *expiry > Instant::now())
            .unwrap_or(false)
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

pub async fn login(
    State(state): State<ApiState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let config = state.config.snapshot();
    let Some(expected) = config.auth.password_hash.clone() else {
        return Err(ApiError(Error::validation(
            "authentication is not configured",
        )));
    };
    if digest(&request.password) != expected.to_lowercase() {
        return Err(ApiError(Error::Unauthorized("invalid credentials".into())));
    }
    let ttl = Duration::from_secs(config.auth.token_ttl_secs);
    let token = state.auth.issue(ttl);
    Ok(Json(json!({
        "token": token,
        "expires_in": config.auth.token_ttl_secs,
    })))
}

pub async fn logout(
    State(state): State<ApiState>,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let token = bearer_token(&request)
        .ok_or_else(|| ApiError(Error::Unauthorized("missing bearer token".into())))?;
    let revoked = state.auth.revoke(&token);
    Ok(Json(json!({ "revoked": revoked })))
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Middleware guarding /api and the push endpoints. A deployment with
/// no password hash runs open.
pub async fn require_auth(
    State(state): State<ApiState>,
    Query(query): Query<TokenQuery>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let config = state.config.snapshot();
    if config.auth.password_hash.is_none() {
        return Ok(next.run(request).await);
    }

    let token = bearer_token(&request).or(query.token);
    match token {
        Some(token) if state.auth.verify(&token) => Ok(next.run(request).await),
        Some(_) => Err(ApiError(Error::Unauthorized("invalid or expired token".into()))),
        None => Err(ApiError(Error::Unauthorized("missing bearer token".into()))),
    }
}
