//! Identity provider collaborator.
//!
//! The provider owns accounts, token caches and the interactive sign-in UI.
//! This crate never inspects token claims; tokens are opaque capability
//! handles with an optional expiry reported by the provider.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shared_types::UserIdentity;

use crate::error::AuthResult;

/// Tokens this close to expiry are treated as already expired.
const EXPIRY_SKEW_SECS: i64 = 300;

/// Opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_on: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_on: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_on,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.expires_on
    }

    /// True when the provider-reported expiry is within the refresh skew.
    /// Tokens without a known expiry are trusted until the provider rejects them.
    pub fn is_expired(&self) -> bool {
        match self.expires_on {
            Some(expires_on) => expires_on - Duration::seconds(EXPIRY_SKEW_SECS) <= Utc::now(),
            None => false,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Account as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub home_account_id: String,
    pub local_account_id: String,
    pub tenant_id: String,
    pub username: String,
    pub name: Option<String>,
}

impl Account {
    /// Read-only identity projection handed to the rest of the app.
    pub fn identity(&self) -> UserIdentity {
        UserIdentity {
            id: self.local_account_id.clone(),
            display_name: self.name.clone().unwrap_or_else(|| self.username.clone()),
            email: self.username.to_lowercase(),
            tenant_id: self.tenant_id.clone(),
            home_account_id: self.home_account_id.clone(),
        }
    }
}

/// Result of a completed interactive sign-in.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub account: Account,
    pub access_token: AccessToken,
}

/// Identity provider operations consumed by the session layer.
///
/// Implementations must report failures classified as
/// [`AuthErrorKind`](crate::error::AuthErrorKind) values. Interactive calls
/// fail with `InteractionInProgress` if one is already active.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Run an interactive sign-in and make the resulting account active.
    async fn login_interactive(&self, scopes: &[String]) -> AuthResult<LoginResult>;

    /// Obtain a token without any user-visible UI.
    async fn acquire_token_silent(
        &self,
        account: &Account,
        scopes: &[String],
        force_refresh: bool,
    ) -> AuthResult<AccessToken>;

    /// Sign the active account out and forget its tokens.
    async fn logout(&self);

    async fn active_account(&self) -> Option<Account>;

    /// Drop cached tokens and any stuck interaction bookkeeping.
    async fn clear_cache(&self);
}

/// A boxed, reference-counted [`IdentityProvider`].
pub type ArcIdentityProvider = Arc<dyn IdentityProvider>;
