//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared_types::{AuthorizationResponse, NotificationKind};

use crate::config::SessionTimeouts;
use crate::directory::Directory;
use crate::error::{AuthError, AuthResult};
use crate::notify::{Notifier, NotifyOptions};
use crate::provider::{AccessToken, Account, IdentityProvider, LoginResult};

pub fn account(email: &str) -> Account {
    let local = email.split('@').next().unwrap_or(email).to_string();
    Account {
        home_account_id: format!("{}.tenant", local),
        local_account_id: local.clone(),
        tenant_id: "tenant".to_string(),
        username: email.to_string(),
        name: Some(local),
    }
}

pub fn token(secret: &str) -> AccessToken {
    AccessToken::new(secret, Some(Utc::now() + chrono::Duration::hours(1)))
}

pub fn scopes() -> Vec<String> {
    vec!["User.Read".to_string()]
}

pub fn timeouts() -> SessionTimeouts {
    SessionTimeouts::default()
}

/// How `active_account` behaves.
#[derive(Debug, Clone)]
pub enum AccountScript {
    Present(Account),
    Absent,
    /// Never resolves, like a provider whose init callback never fires.
    Hang,
}

pub struct FakeProvider {
    account: Mutex<AccountScript>,
    silent: Mutex<VecDeque<AuthResult<AccessToken>>>,
    login: Mutex<VecDeque<AuthResult<LoginResult>>>,
    silent_delay: Mutex<Duration>,
    login_delay: Mutex<Duration>,
    pub silent_calls: AtomicUsize,
    pub login_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub clear_cache_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(script: AccountScript) -> Arc<Self> {
        Arc::new(Self {
            account: Mutex::new(script),
            silent: Mutex::new(VecDeque::new()),
            login: Mutex::new(VecDeque::new()),
            silent_delay: Mutex::new(Duration::ZERO),
            login_delay: Mutex::new(Duration::ZERO),
            silent_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            clear_cache_calls: AtomicUsize::new(0),
        })
    }

    pub fn signed_in(email: &str) -> Arc<Self> {
        Self::new(AccountScript::Present(account(email)))
    }

    pub fn push_silent(&self, result: AuthResult<AccessToken>) {
        self.silent.lock().unwrap().push_back(result);
    }

    pub fn push_login(&self, result: AuthResult<LoginResult>) {
        self.login.lock().unwrap().push_back(result);
    }

    pub fn set_silent_delay(&self, delay: Duration) {
        *self.silent_delay.lock().unwrap() = delay;
    }

    pub fn set_login_delay(&self, delay: Duration) {
        *self.login_delay.lock().unwrap() = delay;
    }

    pub fn silent_calls(&self) -> usize {
        self.silent_calls.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn clear_cache_calls(&self) -> usize {
        self.clear_cache_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn login_interactive(&self, _scopes: &[String]) -> AuthResult<LoginResult> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.login_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .login
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AuthError::unknown("no scripted login")));
        if let Ok(login) = &result {
            *self.account.lock().unwrap() = AccountScript::Present(login.account.clone());
        }
        result
    }

    async fn acquire_token_silent(
        &self,
        _account: &Account,
        _scopes: &[String],
        _force_refresh: bool,
    ) -> AuthResult<AccessToken> {
        self.silent_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.silent_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.silent
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(token("silent-default")))
    }

    async fn logout(&self) {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        *self.account.lock().unwrap() = AccountScript::Absent;
    }

    async fn active_account(&self) -> Option<Account> {
        let script = self.account.lock().unwrap().clone();
        match script {
            AccountScript::Present(account) => Some(account),
            AccountScript::Absent => None,
            AccountScript::Hang => std::future::pending::<Option<Account>>().await,
        }
    }

    async fn clear_cache(&self) {
        self.clear_cache_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeDirectory {
    responses: Mutex<VecDeque<AuthResult<AuthorizationResponse>>>,
    fallback: Mutex<AuthResult<AuthorizationResponse>>,
    pub calls: AtomicUsize,
    pub emails: Mutex<Vec<String>>,
}

impl FakeDirectory {
    /// Directory that answers every lookup with `fallback` unless a
    /// response has been queued.
    pub fn new(fallback: AuthResult<AuthorizationResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: AtomicUsize::new(0),
            emails: Mutex::new(Vec::new()),
        })
    }

    pub fn granting(role: &str) -> Arc<Self> {
        Self::new(Ok(AuthorizationResponse::granted(role)))
    }

    pub fn push(&self, response: AuthResult<AuthorizationResponse>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_fallback(&self, response: AuthResult<AuthorizationResponse>) {
        *self.fallback.lock().unwrap() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn is_user_authorized(
        &self,
        _token: &AccessToken,
        email: &str,
    ) -> AuthResult<AuthorizationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.emails.lock().unwrap().push(email.to_string());
        let queued = self.responses.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<(NotificationKind, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, kind: NotificationKind, message: &str, _options: NotifyOptions) {
        self.messages.lock().unwrap().push((kind, message.to_string()));
    }
}
