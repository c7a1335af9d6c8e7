//! Microsoft Entra ID identity provider.
//!
//! Interactive sign-in uses the OAuth 2.0 device authorization grant, so it
//! works from a terminal. Silent acquisition redeems the cached refresh
//! token. Tokens and the account live in memory for the process lifetime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthErrorKind, AuthResult};
use crate::graph::classify_status;
use crate::provider::{AccessToken, Account, IdentityProvider, LoginResult};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const SLOW_DOWN_INCREMENT_SECS: u64 = 5;

/// Scopes always requested alongside the configured Graph scopes.
const BASE_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// What the user must do to finish a device code sign-in.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodePrompt {
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default)]
    pub message: String,
}

/// Presents a device code prompt to the user.
pub type PromptHandler = Arc<dyn Fn(&DeviceCodePrompt) + Send + Sync>;

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    interval: Option<u64>,
    #[serde(flatten)]
    prompt: DeviceCodePrompt,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Error body returned by the token endpoints.
#[derive(Debug, Default, Deserialize)]
struct AadErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: String,
    display_name: Option<String>,
    mail: Option<String>,
    user_principal_name: String,
}

#[derive(Default)]
struct CacheState {
    account: Option<Account>,
    access_token: Option<AccessToken>,
    refresh_token: Option<String>,
    /// Set while a device code is outstanding.
    pending_device_code: Option<String>,
}

pub struct EntraIdentityProvider {
    client: reqwest::Client,
    config: AuthConfig,
    prompt: PromptHandler,
    cache: Mutex<CacheState>,
}

impl EntraIdentityProvider {
    pub fn new(config: AuthConfig, prompt: PromptHandler) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            prompt,
            cache: Mutex::new(CacheState::default()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, CacheState> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scope_param(scopes: &[String]) -> String {
        scopes
            .iter()
            .map(String::as_str)
            .chain(BASE_SCOPES)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// POST a form to the token endpoint. Transport failures are errors;
    /// an AAD error body is returned as `Ok(Err(..))` for the caller to
    /// interpret.
    async fn request_token(
        &self,
        form: &[(&str, &str)],
    ) -> AuthResult<Result<TokenResponse, (u16, AadErrorResponse)>> {
        let response = self
            .client
            .post(format!("{}/token", self.config.authority()))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let tokens = response
                .json::<TokenResponse>()
                .await
                .map_err(|e| AuthError::unknown(format!("invalid token response: {}", e)))?;
            return Ok(Ok(tokens));
        }

        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<AadErrorResponse>(&body).unwrap_or(AadErrorResponse {
            error: String::new(),
            error_description: body,
        });
        Ok(Err((status.as_u16(), error)))
    }

    async fn start_device_code(&self, scopes: &[String]) -> AuthResult<DeviceCodeResponse> {
        let scope = Self::scope_param(scopes);
        let response = self
            .client
            .post(format!("{}/devicecode", self.config.authority()))
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = serde_json::from_str::<AadErrorResponse>(&body).unwrap_or_default();
            return Err(classify_aad_error(
                status.as_u16(),
                &error.error,
                &error.error_description,
            ));
        }

        response
            .json::<DeviceCodeResponse>()
            .await
            .map_err(|e| AuthError::unknown(format!("invalid device code response: {}", e)))
    }

    async fn poll_device_code(&self, device: &DeviceCodeResponse) -> AuthResult<TokenResponse> {
        let mut interval =
            Duration::from_secs(device.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS));
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(device.prompt.expires_in);

        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::timeout(
                    "device code expired before sign-in completed",
                ));
            }

            let form = [
                ("grant_type", DEVICE_CODE_GRANT),
                ("client_id", self.config.client_id.as_str()),
                ("device_code", device.device_code.as_str()),
            ];
            match self.request_token(&form).await? {
                Ok(tokens) => return Ok(tokens),
                Err((_, error)) if error.error == "authorization_pending" => {
                    tracing::debug!("Waiting for the user to finish device code sign-in");
                }
                Err((_, error)) if error.error == "slow_down" => {
                    interval += Duration::from_secs(SLOW_DOWN_INCREMENT_SECS);
                    tracing::debug!(
                        "Token endpoint asked to slow down, polling every {:?}",
                        interval
                    );
                }
                Err((status, error)) => {
                    return Err(classify_aad_error(
                        status,
                        &error.error,
                        &error.error_description,
                    ));
                }
            }
        }
    }

    async fn fetch_account(&self, access_token: &str) -> AuthResult<Account> {
        let response = self
            .client
            .get(format!("{}/me", self.config.graph_base_url))
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let user: GraphUser = response
            .json()
            .await
            .map_err(|e| AuthError::unknown(format!("invalid profile response: {}", e)))?;

        Ok(account_from_profile(user, &self.config.tenant_id))
    }

    fn store_tokens(&self, tokens: &TokenResponse) -> AccessToken {
        let token = AccessToken::new(
            tokens.access_token.clone(),
            tokens
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        );
        let mut cache = self.cache();
        cache.access_token = Some(token.clone());
        if let Some(refresh) = &tokens.refresh_token {
            cache.refresh_token = Some(refresh.clone());
        }
        token
    }
}

fn account_from_profile(user: GraphUser, tenant_id: &str) -> Account {
    let username = user.mail.unwrap_or(user.user_principal_name);
    Account {
        home_account_id: format!("{}.{}", user.id, tenant_id),
        local_account_id: user.id,
        tenant_id: tenant_id.to_string(),
        username,
        name: user.display_name,
    }
}

/// Classify an error returned by the Entra ID token endpoints.
pub fn classify_aad_error(status: u16, error: &str, description: &str) -> AuthError {
    let detail = if description.is_empty() {
        format!("{} (HTTP {})", error, status)
    } else {
        format!("{}: {}", error, description)
    };

    let kind = match error {
        "interaction_required" | "login_required" | "invalid_grant" => {
            AuthErrorKind::InteractionRequired
        }
        "consent_required" => AuthErrorKind::ConsentRequired,
        "authorization_declined" | "access_denied" => AuthErrorKind::UserCancelled,
        "expired_token" => AuthErrorKind::TimeoutError,
        "temporarily_unavailable" => AuthErrorKind::ServerError,
        _ if (500..=599).contains(&status) => AuthErrorKind::ServerError,
        _ => AuthErrorKind::Unknown,
    };
    AuthError::new(kind, detail)
}

#[async_trait]
impl IdentityProvider for EntraIdentityProvider {
    async fn login_interactive(&self, scopes: &[String]) -> AuthResult<LoginResult> {
        if self.cache().pending_device_code.is_some() {
            return Err(AuthError::interaction_in_progress(
                "a device code sign-in is already pending",
            ));
        }

        let device = self.start_device_code(scopes).await?;
        self.cache().pending_device_code = Some(device.device_code.clone());
        (self.prompt)(&device.prompt);
        tracing::info!("Device code issued, waiting for the user to sign in");

        let outcome = self.poll_device_code(&device).await;
        {
            let mut cache = self.cache();
            if cache.pending_device_code.as_deref() == Some(device.device_code.as_str()) {
                cache.pending_device_code = None;
            }
        }
        let tokens = outcome?;

        let access_token = self.store_tokens(&tokens);
        let account = self.fetch_account(access_token.secret()).await?;
        tracing::info!("Signed in as {}", account.username);
        self.cache().account = Some(account.clone());

        Ok(LoginResult {
            account,
            access_token,
        })
    }

    async fn acquire_token_silent(
        &self,
        account: &Account,
        scopes: &[String],
        force_refresh: bool,
    ) -> AuthResult<AccessToken> {
        let refresh_token = {
            let cache = self.cache();
            let same_account = cache
                .account
                .as_ref()
                .is_some_and(|a| a.home_account_id == account.home_account_id);
            if !same_account {
                return Err(AuthError::interaction_required(format!(
                    "no cached sign-in for {}",
                    account.username
                )));
            }
            if !force_refresh {
                if let Some(token) = cache.access_token.as_ref().filter(|t| !t.is_expired()) {
                    return Ok(token.clone());
                }
            }
            cache.refresh_token.clone()
        };

        let Some(refresh_token) = refresh_token else {
            return Err(AuthError::interaction_required("no refresh token cached"));
        };

        let scope = Self::scope_param(scopes);
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("scope", scope.as_str()),
        ];
        match self.request_token(&form).await? {
            Ok(tokens) => {
                tracing::debug!("Refreshed access token for {}", account.username);
                Ok(self.store_tokens(&tokens))
            }
            Err((status, error)) => {
                let err = classify_aad_error(status, &error.error, &error.error_description);
                if err.requires_interaction() {
                    self.cache().refresh_token = None;
                }
                Err(err)
            }
        }
    }

    async fn logout(&self) {
        *self.cache() = CacheState::default();
        tracing::info!("Cleared Entra ID account and tokens");
    }

    async fn active_account(&self) -> Option<Account> {
        self.cache().account.clone()
    }

    async fn clear_cache(&self) {
        let mut cache = self.cache();
        cache.access_token = None;
        cache.pending_device_code = None;
    }
}
