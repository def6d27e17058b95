//! Configuration for the HTTP front.

use agentrun_base::HTTP_ADDR;
use serde::Deserialize;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: HTTP_ADDR.clone(),
        }
    }
}

/// Bearer authentication (env prefix `AUTH_`)
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// `token:user,token:user`
    pub tokens: String,
    /// `user,user`: users allowed to call the queue admin endpoints
    pub admin_users: String,
}

impl AuthConfig {
    pub fn from_env() -> Self {
        envy::prefixed("AUTH_")
            .from_env::<AuthConfig>()
            .unwrap_or_else(|e| {
                tracing::info!("Use default AuthConfig (disabled): {:?}", e);
                Self::default()
            })
    }
}
