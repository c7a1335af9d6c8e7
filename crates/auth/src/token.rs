//! Token acquisition with in-flight de-duplication.
//!
//! Concurrent callers that need a token for the same account and scope set
//! share one underlying request. Silent acquisition is tried first; only
//! an interaction-required classification escalates to an interactive flow
//! through the [`InteractionSerializer`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use crate::config::SessionTimeouts;
use crate::error::{AuthError, AuthResult};
use crate::interaction::InteractionSerializer;
use crate::provider::{AccessToken, Account, ArcIdentityProvider, LoginResult};
use crate::session::SessionStore;

type TokenFlight = Shared<BoxFuture<'static, AuthResult<AccessToken>>>;

/// Identifies requests that may share a result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    home_account_id: Option<String>,
    scopes: String,
}

impl FlightKey {
    fn new(account: Option<&Account>, scopes: &[String]) -> Self {
        let mut scopes: Vec<String> = scopes.iter().map(|s| s.to_lowercase()).collect();
        scopes.sort();
        scopes.dedup();
        Self {
            home_account_id: account.map(|a| a.home_account_id.clone()),
            scopes: scopes.join(" "),
        }
    }
}

/// Acquires access tokens for the active account. Cheap to clone.
#[derive(Clone)]
pub struct TokenAcquirer {
    inner: Arc<Inner>,
}

struct Inner {
    provider: ArcIdentityProvider,
    interactions: InteractionSerializer,
    store: SessionStore,
    scopes: Vec<String>,
    timeouts: SessionTimeouts,
    cached: Mutex<Option<AccessToken>>,
    in_flight: Mutex<HashMap<FlightKey, (u64, TokenFlight)>>,
    next_flight: AtomicU64,
    cancel: Mutex<CancellationToken>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TokenAcquirer {
    pub fn new(
        provider: ArcIdentityProvider,
        interactions: InteractionSerializer,
        store: SessionStore,
        scopes: Vec<String>,
        timeouts: &SessionTimeouts,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                interactions,
                store,
                scopes,
                timeouts: timeouts.clone(),
                cached: Mutex::new(None),
                in_flight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn scopes(&self) -> &[String] {
        &self.inner.scopes
    }

    /// Cached token, if one exists and has not expired.
    pub fn cached_token(&self) -> Option<AccessToken> {
        lock(&self.inner.cached)
            .as_ref()
            .filter(|token| !token.is_expired())
            .cloned()
    }

    /// Number of distinct requests currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Return a usable token, acquiring one if needed.
    ///
    /// With `force_refresh = false` a cached, unexpired token is returned
    /// without suspending. Otherwise the caller starts, or joins, the single
    /// in-flight request for the active account. Joiners wait at most the
    /// de-duplication window and then receive a timeout error.
    pub async fn acquire_token(&self, force_refresh: bool) -> AuthResult<AccessToken> {
        if !force_refresh {
            if let Some(token) = self.cached_token() {
                return Ok(token);
            }
        }

        let account = self.inner.provider.active_account().await;
        let key = FlightKey::new(account.as_ref(), &self.inner.scopes);
        let (flight, joined) = self.start_or_join(key, account, force_refresh);

        if !joined {
            return flight.await;
        }

        tracing::debug!("Joining in-flight token request");
        match tokio::time::timeout(self.inner.timeouts.dedup_wait, flight).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "In-flight token request did not settle within {:?}",
                    self.inner.timeouts.dedup_wait
                );
                Err(AuthError::timeout(format!(
                    "in-flight token request did not settle within {:?}",
                    self.inner.timeouts.dedup_wait
                )))
            }
        }
    }

    fn start_or_join(
        &self,
        key: FlightKey,
        account: Option<Account>,
        force_refresh: bool,
    ) -> (TokenFlight, bool) {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some((_, flight)) = in_flight.get(&key) {
            return (flight.clone(), true);
        }

        let id = self.inner.next_flight.fetch_add(1, Ordering::SeqCst);
        let cancel = lock(&self.inner.cancel).clone();
        let this = self.clone();
        let flight_key = key.clone();

        let flight = async move {
            let result = this.acquire_uncached(account, force_refresh, cancel).await;
            this.finish_flight(&flight_key, id);
            result
        }
        .boxed()
        .shared();

        in_flight.insert(key, (id, flight.clone()));
        (flight, false)
    }

    fn finish_flight(&self, key: &FlightKey, id: u64) {
        let mut in_flight = lock(&self.inner.in_flight);
        if in_flight.get(key).is_some_and(|(current, _)| *current == id) {
            in_flight.remove(key);
        }
    }

    async fn acquire_uncached(
        &self,
        account: Option<Account>,
        force_refresh: bool,
        cancel: CancellationToken,
    ) -> AuthResult<AccessToken> {
        let result = match account {
            Some(account) => match self.acquire_silent(&account, force_refresh).await {
                Err(err) if err.requires_interaction() => {
                    tracing::info!(
                        "Silent token acquisition for {} needs interaction ({}), escalating",
                        account.username,
                        err.kind
                    );
                    self.run_interactive(&cancel)
                        .await
                        .map(|login| login.access_token)
                }
                other => other,
            },
            None => {
                tracing::info!("No active account, starting interactive sign-in");
                self.run_interactive(&cancel)
                    .await
                    .map(|login| login.access_token)
            }
        };

        // A reset while this flight ran makes its outcome stale.
        if cancel.is_cancelled() {
            tracing::debug!("Discarding token result from a superseded request");
            return Err(AuthError::cancelled());
        }

        match &result {
            Ok(token) => self.remember(token.clone()),
            Err(err) => {
                tracing::warn!("Token acquisition failed: {}", err);
                self.inner.store.record_error(err.clone());
            }
        }
        result
    }

    async fn acquire_silent(
        &self,
        account: &Account,
        force_refresh: bool,
    ) -> AuthResult<AccessToken> {
        let timeout = self.inner.timeouts.request_timeout;
        let request = self.inner.provider.acquire_token_silent(
            account,
            &self.inner.scopes,
            force_refresh,
        );

        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::timeout(format!(
                "silent token request did not complete within {:?}",
                timeout
            ))),
        }
    }

    async fn run_interactive(&self, cancel: &CancellationToken) -> AuthResult<LoginResult> {
        let provider = self.inner.provider.clone();
        let scopes = self.inner.scopes.clone();
        self.inner
            .interactions
            .run(cancel, || {
                let provider = provider.clone();
                let scopes = scopes.clone();
                async move { provider.login_interactive(&scopes).await }
            })
            .await
    }

    /// Run an interactive sign-in directly, bypassing silent acquisition.
    pub async fn sign_in_interactive(&self) -> AuthResult<LoginResult> {
        let cancel = lock(&self.inner.cancel).clone();
        let result = self.run_interactive(&cancel).await;
        match &result {
            Ok(login) => self.remember(login.access_token.clone()),
            Err(err) => self.inner.store.record_error(err.clone()),
        }
        result
    }

    fn remember(&self, token: AccessToken) {
        *lock(&self.inner.cached) = Some(token.clone());
        self.inner.store.record_token(token);
    }

    /// Drop the cached token so the next call goes back to the provider.
    /// In-flight requests are left running.
    pub fn evict(&self) {
        if lock(&self.inner.cached).take().is_some() {
            tracing::debug!("Cached token evicted");
        }
    }

    /// Forget cached tokens and abandon in-flight requests.
    pub fn reset(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.cancel), CancellationToken::new());
        previous.cancel();
        lock(&self.inner.cached).take();
        lock(&self.inner.in_flight).clear();
        tracing::debug!("Token cache cleared");
    }
}
