//! Authentication middleware for the HTTP server.
//!
//! With auth enabled every `/api` route except `/api/health` needs
//! `Authorization: Bearer <token>`; the token maps to a user id.
//! With auth disabled the user id is taken from `X-User-Id`
//! (default `anonymous`) and every user may use the admin routes.

use crate::config::AuthConfig;
use crate::error::AppError;
use agentrun_base::error::AgentRunError;
use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ANONYMOUS_USER: &str = "anonymous";

/// the caller of a request, stored in the request extensions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
    pub is_admin: bool,
}

#[derive(Debug, Default)]
pub struct TokenStore {
    enabled: bool,
    users_by_token: HashMap<String, String>,
    admin_users: HashSet<String>,
}

impl TokenStore {
    pub fn new(
        enabled: bool,
        users_by_token: HashMap<String, String>,
        admin_users: HashSet<String>,
    ) -> Self {
        Self {
            enabled,
            users_by_token,
            admin_users,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut users_by_token = HashMap::new();
        for entry in config.tokens.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once(':') {
                Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                    users_by_token.insert(token.to_string(), user.to_string());
                }
                _ => {
                    return Err(AgentRunError::InvalidParameter(
                        "AUTH_TOKENS entries must be token:user".to_string(),
                    )
                    .into())
                }
            }
        }
        if config.enabled && users_by_token.is_empty() {
            tracing::warn!("auth enabled without tokens: every request will be rejected");
        }
        let admin_users = config
            .admin_users
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect();
        Ok(Self::new(config.enabled, users_by_token, admin_users))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn user_for(&self, token: &str) -> Option<&str> {
        self.users_by_token.get(token).map(String::as_str)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_users.contains(user_id)
    }

    /// resolve the caller from request headers
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, AppError> {
        if !self.enabled {
            let user_id = headers
                .get(USER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(ANONYMOUS_USER)
                .to_string();
            return Ok(AuthUser {
                user_id,
                is_admin: true,
            });
        }
        let token = extract_bearer_token(headers)
            .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;
        let user_id = self
            .user_for(&token)
            .ok_or_else(|| AppError::Unauthorized("invalid token".to_string()))?
            .to_string();
        Ok(AuthUser {
            is_admin: self.is_admin(&user_id),
            user_id,
        })
    }
}

/// Extract Bearer token from Authorization header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer ").map(String::from))
}

pub async fn auth_middleware(
    State(token_store): State<Arc<TokenStore>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = token_store.authenticate(request.headers())?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// must run after [`auth_middleware`]
pub async fn admin_middleware(request: Request, next: Next) -> Result<Response, AppError> {
    match request.extensions().get::<AuthUser>() {
        Some(user) if user.is_admin => Ok(next.run(request).await),
        Some(user) => Err(AppError::Forbidden(format!(
            "user {} may not use admin endpoints",
            user.user_id
        ))),
        None => Err(AppError::Unauthorized("not authenticated".to_string())),
    }
}
