//! Startup configuration for the authentication layer.

use std::time::Duration;

use crate::error::ConfigError;

/// Identity and directory configuration loaded from environment
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub tenant_id: String,
    pub site_id: String,
    pub authorized_users_list: String,
    pub scopes: Vec<String>,
    pub graph_base_url: String,
    pub authority_host: String,
}

impl AuthConfig {
    /// Load auth configuration from environment variables.
    ///
    /// Required env vars:
    /// - `ENTRA_CLIENT_ID`: Application (client) ID of the app registration
    /// - `ENTRA_TENANT_ID`: Directory (tenant) ID
    /// - `SHAREPOINT_SITE_ID`: Site hosting the authorized users list
    ///
    /// Optional env vars:
    /// - `AUTHORIZED_USERS_LIST`: List name (default `AuthorizedUsers`)
    /// - `GRAPH_SCOPES`: Space separated scopes (default `User.Read Sites.ReadWrite.All`)
    /// - `GRAPH_BASE_URL`: Graph endpoint (default `https://graph.microsoft.com/v1.0`)
    /// - `ENTRA_AUTHORITY_HOST`: Authority host (default `https://login.microsoftonline.com`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = required_var("ENTRA_CLIENT_ID")?;
        let tenant_id = required_var("ENTRA_TENANT_ID")?;
        let site_id = required_var("SHAREPOINT_SITE_ID")?;

        let scopes: Vec<String> = std::env::var("GRAPH_SCOPES")
            .unwrap_or_else(|_| default_scopes().join(" "))
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        if scopes.is_empty() {
            return Err(ConfigError::Invalid {
                var: "GRAPH_SCOPES",
                reason: "at least one scope is required".to_string(),
            });
        }

        Ok(Self {
            client_id,
            tenant_id,
            site_id,
            authorized_users_list: std::env::var("AUTHORIZED_USERS_LIST")
                .unwrap_or_else(|_| "AuthorizedUsers".to_string()),
            scopes,
            graph_base_url: std::env::var("GRAPH_BASE_URL")
                .unwrap_or_else(|_| "https://graph.microsoft.com/v1.0".to_string())
                .trim_end_matches('/')
                .to_string(),
            authority_host: std::env::var("ENTRA_AUTHORITY_HOST")
                .unwrap_or_else(|_| "https://login.microsoftonline.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// OAuth 2.0 endpoint base for the configured tenant.
    pub fn authority(&self) -> String {
        format!("{}/{}/oauth2/v2.0", self.authority_host, self.tenant_id)
    }
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn default_scopes() -> Vec<&'static str> {
    vec!["User.Read", "Sites.ReadWrite.All"]
}

/// Upper bounds for every wait in the authentication layer.
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    /// Time an interactive flow may hold the interaction lock (default: 60s)
    pub interaction_timeout: Duration,
    /// Attempts made while waiting for a busy interaction lock (default: 30)
    pub interaction_poll_attempts: u32,
    /// Delay between interaction lock polls (default: 1s)
    pub interaction_poll_interval: Duration,
    /// How long a caller joins an in-flight token request (default: 10s)
    pub dedup_wait: Duration,
    /// Upper bound on a single silent token call or directory lookup (default: 10s)
    pub request_timeout: Duration,
    /// Grace period for the identity provider to report an account (default: 2s)
    pub init_grace: Duration,
    /// Directory lookup attempts before giving up (default: 3)
    pub validation_attempts: u32,
    /// First backoff between directory attempts, doubled each retry (default: 1s)
    pub validation_backoff: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            interaction_timeout: Duration::from_secs(60),
            interaction_poll_attempts: 30,
            interaction_poll_interval: Duration::from_secs(1),
            dedup_wait: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            init_grace: Duration::from_secs(2),
            validation_attempts: 3,
            validation_backoff: Duration::from_secs(1),
        }
    }
}

impl SessionTimeouts {
    /// Load timeout overrides from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            interaction_timeout: env_millis("AUTH_INTERACTION_TIMEOUT_MS")
                .unwrap_or(defaults.interaction_timeout),
            interaction_poll_attempts: env_number("AUTH_INTERACTION_POLL_ATTEMPTS")
                .unwrap_or(defaults.interaction_poll_attempts),
            interaction_poll_interval: env_millis("AUTH_INTERACTION_POLL_INTERVAL_MS")
                .unwrap_or(defaults.interaction_poll_interval),
            dedup_wait: env_millis("AUTH_DEDUP_WAIT_MS").unwrap_or(defaults.dedup_wait),
            request_timeout: env_millis("AUTH_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            init_grace: env_millis("AUTH_INIT_GRACE_MS").unwrap_or(defaults.init_grace),
            validation_attempts: env_number("AUTH_VALIDATION_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.validation_attempts),
            validation_backoff: env_millis("AUTH_VALIDATION_BACKOFF_MS")
                .unwrap_or(defaults.validation_backoff),
        }
    }

    /// Backoff before the retry that follows attempt `attempt` (1-indexed).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.validation_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

fn env_number(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Duration::from_millis)
}
