//! Session state machine.
//!
//! [`SessionManager`] composes token acquisition, interaction serialization
//! and allow-list validation into a single [`Session`] value that moves
//! between `Loading`, `Authorized` and `Unauthorized`. Every transition that
//! the user should see produces at most one notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use shared_types::{CapabilitySet, NotificationKind, Role, UserIdentity};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::SessionTimeouts;
use crate::directory::ArcDirectory;
use crate::error::{AuthError, AuthErrorKind, AuthResult};
use crate::interaction::{InteractionSerializer, InteractionState};
use crate::notify::{ArcNotifier, NotifyOptions};
use crate::provider::{AccessToken, Account, ArcIdentityProvider};
use crate::session::{
    AuthorizationFailure, FailureReason, FailureStage, Session, SessionStore, Ticket,
};
use crate::token::TokenAcquirer;
use crate::validator::{Authorization, AuthorizationValidator};

const WELCOME_TOAST_DURATION: Duration = Duration::from_secs(3);
const SIGN_OUT_TOAST_DURATION: Duration = Duration::from_secs(2);

pub struct SessionManager {
    provider: ArcIdentityProvider,
    notifier: ArcNotifier,
    store: SessionStore,
    interactions: InteractionSerializer,
    tokens: TokenAcquirer,
    validator: AuthorizationValidator,
    timeouts: SessionTimeouts,
    cancel: Mutex<CancellationToken>,
    timeouts_seen: AtomicU64,
}

impl SessionManager {
    pub fn new(
        provider: ArcIdentityProvider,
        directory: ArcDirectory,
        notifier: ArcNotifier,
        scopes: Vec<String>,
        timeouts: SessionTimeouts,
    ) -> Self {
        let store = SessionStore::new();
        let interactions =
            InteractionSerializer::new(provider.clone(), notifier.clone(), &timeouts);
        let tokens = TokenAcquirer::new(
            provider.clone(),
            interactions.clone(),
            store.clone(),
            scopes,
            &timeouts,
        );
        let validator = AuthorizationValidator::new(directory, &timeouts);

        Self {
            provider,
            notifier,
            store,
            interactions,
            tokens,
            validator,
            timeouts,
            cancel: Mutex::new(CancellationToken::new()),
            timeouts_seen: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> Session {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.store.subscribe()
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.store.snapshot().capabilities()
    }

    pub fn has_role(&self, required: Role) -> bool {
        self.store.snapshot().has_role(required)
    }

    pub fn interaction_state(&self) -> InteractionState {
        self.interactions.state()
    }

    pub fn validator(&self) -> &AuthorizationValidator {
        &self.validator
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Evaluate the provider's existing sign-in on startup.
    ///
    /// The provider gets a short grace period to report its active account.
    /// No account, or no answer in time, settles to `Unauthorized` so the
    /// session never stays in `Loading`.
    pub async fn initialize(&self) -> Session {
        tracing::info!("Initializing session");
        self.evaluate(false).await
    }

    /// User-triggered re-validation of the current account, for example
    /// after an administrator has granted access.
    pub async fn retry(&self) -> Session {
        tracing::info!("Retrying authorization");
        self.evaluate(false).await
    }

    /// Re-acquire the token bypassing the cache, then re-validate.
    pub async fn refresh(&self) -> Session {
        tracing::info!("Refreshing session");
        self.evaluate(true).await
    }

    /// Run an interactive sign-in and validate the resulting account.
    pub async fn sign_in(&self) -> Session {
        let ticket = self.begin_transition();
        let cancel = self.current_cancel();
        tracing::info!("Starting interactive sign-in");

        match self.tokens.sign_in_interactive().await {
            Ok(login) => {
                self.settle(ticket, login.account.identity(), login.access_token, &cancel)
                    .await
            }
            Err(err) => self.fail(ticket, None, err, FailureStage::SignIn),
        }
        self.store.snapshot()
    }

    /// Drop every credential, sign out of the provider and re-evaluate.
    pub async fn sign_out(&self) -> Session {
        tracing::info!("Signing out");
        let previous = std::mem::replace(
            &mut *self.cancel.lock().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        previous.cancel();

        self.tokens.reset();
        self.provider.logout().await;
        self.store.reset();
        self.notifier.notify(
            NotificationKind::Info,
            "You have been signed out.",
            NotifyOptions::auto_close(SIGN_OUT_TOAST_DURATION),
        );

        self.initialize().await
    }

    /// Token for calling the list store. Only available while authorized.
    pub async fn access_token(&self) -> AuthResult<AccessToken> {
        if !self.store.snapshot().is_authorized() {
            return Err(AuthError::interaction_required(
                "no authorized session; sign in first",
            ));
        }
        self.tokens.acquire_token(false).await
    }

    /// Enter `Loading` and mark interaction timeouts reported so far as
    /// belonging to earlier transitions.
    fn begin_transition(&self) -> Ticket {
        self.timeouts_seen
            .store(self.interactions.timeouts_reported(), Ordering::SeqCst);
        self.store.begin_loading()
    }

    async fn evaluate(&self, force_refresh: bool) -> Session {
        let ticket = self.begin_transition();
        let cancel = self.current_cancel();

        let grace = self.timeouts.init_grace;
        let account = match tokio::time::timeout(grace, self.provider.active_account()).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                tracing::info!("No active account");
                self.reject(
                    ticket,
                    None,
                    AuthorizationFailure::sign_in_required("Sign in to continue."),
                    None,
                );
                return self.store.snapshot();
            }
            Err(_) => {
                tracing::warn!(
                    "Identity provider did not report an account within {:?}",
                    grace
                );
                let err = AuthError::timeout(format!(
                    "identity provider did not initialize within {:?}",
                    grace
                ));
                self.fail(ticket, None, err, FailureStage::SignIn);
                return self.store.snapshot();
            }
        };

        self.authorize_account(ticket, account, force_refresh, &cancel)
            .await;
        self.store.snapshot()
    }

    async fn authorize_account(
        &self,
        ticket: Ticket,
        account: Account,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) {
        let user = account.identity();
        match self.tokens.acquire_token(force_refresh).await {
            Ok(token) => self.settle(ticket, user, token, cancel).await,
            Err(err) => self.fail(ticket, Some(user), err, FailureStage::SignIn),
        }
    }

    /// Validate `user` and apply the outcome. Only called once a token exists.
    ///
    /// A directory that rejects the token itself gets one freshly acquired
    /// token, escalating to interactive sign-in if the provider needs it.
    async fn settle(
        &self,
        ticket: Ticket,
        user: UserIdentity,
        mut token: AccessToken,
        cancel: &CancellationToken,
    ) {
        let mut reacquired = false;

        let outcome = loop {
            if !self.store.is_current(ticket) {
                tracing::debug!("Session changed before validating {}, skipping", user.email);
                return;
            }

            match self.validator.validate(&token, &user.email, cancel).await {
                Err(err) if err.requires_interaction() && !reacquired => {
                    tracing::info!(
                        "Allow-list rejected the token for {} ({}), acquiring a new one",
                        user.email,
                        err
                    );
                    reacquired = true;
                    self.tokens.evict();
                    match self.tokens.acquire_token(true).await {
                        Ok(fresh) => token = fresh,
                        Err(err) => {
                            self.fail(ticket, Some(user), err, FailureStage::SignIn);
                            return;
                        }
                    }
                }
                outcome => break outcome,
            }
        };

        match outcome {
            Ok(Authorization {
                authorized: true,
                role: Some(role),
            }) => {
                let name = user.display_name.clone();
                if self.store.authorize(ticket, user, token, role) {
                    self.notifier.notify(
                        NotificationKind::Success,
                        &format!("Welcome, {}!", name),
                        NotifyOptions::auto_close(WELCOME_TOAST_DURATION),
                    );
                }
            }
            Ok(_) => {
                let failure = AuthorizationFailure::denied(&user.email);
                let message = failure.message.clone();
                let error = AuthError::denied(format!("{} is not on the allow-list", user.email));
                if self.reject(ticket, Some(user), failure, Some(error)) {
                    self.notifier.notify(
                        NotificationKind::Error,
                        &message,
                        NotifyOptions::sticky("authorization-denied"),
                    );
                }
            }
            Err(err) => self.fail(ticket, Some(user), err, FailureStage::Verification),
        }
    }

    fn fail(
        &self,
        ticket: Ticket,
        user: Option<UserIdentity>,
        err: AuthError,
        stage: FailureStage,
    ) {
        let failure = AuthorizationFailure::from_error(&err, stage);
        let kind = match failure.reason {
            FailureReason::Denied | FailureReason::VerificationFailed => NotificationKind::Error,
            FailureReason::SignInRequired => NotificationKind::Warning,
        };
        let message = failure.message.clone();
        // The serializer already warned about an interaction it had to reset.
        let reported = self.interactions.timeouts_reported();
        let already_reported = err.kind == AuthErrorKind::TimeoutError
            && self.timeouts_seen.swap(reported, Ordering::SeqCst) < reported;
        let silent = err.kind.is_silent() || already_reported;

        if self.reject(ticket, user, failure, Some(err)) && !silent {
            self.notifier
                .notify(kind, &message, NotifyOptions::sticky("authorization-error"));
        }
    }

    /// Reject the session. A token the session was rejected with is never
    /// handed out again, so the next attempt goes back to the provider.
    fn reject(
        &self,
        ticket: Ticket,
        user: Option<UserIdentity>,
        failure: AuthorizationFailure,
        error: Option<AuthError>,
    ) -> bool {
        let applied = self.store.reject(ticket, user, failure, error);
        if applied {
            self.tokens.evict();
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LoginResult;
    use crate::test_support::{
        account, scopes, timeouts, token, AccountScript, FakeDirectory, FakeProvider,
        RecordingNotifier,
    };
    use shared_types::{AuthorizationResponse, SessionStatus};
    use std::sync::Arc;
    use tokio::time::Instant;

    struct Harness {
        manager: SessionManager,
        provider: Arc<FakeProvider>,
        directory: Arc<FakeDirectory>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(provider: Arc<FakeProvider>, directory: Arc<FakeDirectory>) -> Harness {
        let notifier = RecordingNotifier::new();
        let manager = SessionManager::new(
            provider.clone(),
            directory.clone(),
            notifier.clone(),
            scopes(),
            timeouts(),
        );
        Harness {
            manager,
            provider,
            directory,
            notifier,
        }
    }

    fn assert_role_invariant(session: &Session) {
        assert_eq!(session.role().is_some(), session.is_authorized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_provider_settles_unauthorized_after_grace() {
        let h = harness(
            FakeProvider::new(AccountScript::Hang),
            FakeDirectory::granting("Admin"),
        );
        let started = Instant::now();

        let session = h.manager.initialize().await;

        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(session.status(), SessionStatus::Unauthorized);
        assert_eq!(
            session.authorization_error().unwrap().reason,
            FailureReason::SignInRequired
        );
        assert_eq!(
            session.last_error().unwrap().kind,
            AuthErrorKind::TimeoutError
        );
        assert_eq!(h.directory.calls(), 0);
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Warning]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_account_settles_unauthorized_quietly() {
        let h = harness(
            FakeProvider::new(AccountScript::Absent),
            FakeDirectory::granting("Admin"),
        );

        let session = h.manager.initialize().await;

        assert_eq!(session.status(), SessionStatus::Unauthorized);
        assert!(session.access_token().is_none());
        assert_eq!(h.provider.login_calls(), 0);
        assert_eq!(h.notifier.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_grant_enables_delete_capabilities() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::granting("Admin"),
        );

        let session = h.manager.initialize().await;

        assert_eq!(session.status(), SessionStatus::Authorized);
        assert_eq!(session.role(), Some(Role::Admin));
        assert_eq!(session.user().unwrap().email, "alice@contoso.com");
        let caps = h.manager.capabilities();
        assert!(caps.can_delete);
        assert!(caps.can_bulk_delete);
        assert!(h.manager.has_role(Role::User));
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_then_retry_reinvokes_directory() {
        let h = harness(
            FakeProvider::signed_in("bob@contoso.com"),
            FakeDirectory::new(Ok(AuthorizationResponse::denied())),
        );

        let session = h.manager.initialize().await;
        assert_eq!(session.status(), SessionStatus::Unauthorized);
        let failure = session.authorization_error().unwrap();
        assert_eq!(failure.reason, FailureReason::Denied);
        assert!(failure.message.contains("bob@contoso.com"));
        assert!(session.access_token().is_none());
        assert_eq!(h.directory.calls(), 1);
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Error]);

        h.directory
            .set_fallback(Ok(AuthorizationResponse::granted("User")));
        let session = h.manager.retry().await;

        assert_eq!(h.directory.calls(), 2);
        assert_eq!(session.status(), SessionStatus::Authorized);
        assert_eq!(session.role(), Some(Role::User));
        assert!(session.authorization_error().is_none());
        // The token the denial was issued against is not reused.
        assert_eq!(h.provider.silent_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_rejected_by_directory_is_reacquired_once() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::granting("User"),
        );
        h.provider.push_silent(Ok(token("revoked")));
        h.provider.push_silent(Ok(token("fresh")));
        h.directory
            .push(Err(AuthError::interaction_required("Graph returned HTTP 401")));

        let session = h.manager.initialize().await;

        assert_eq!(session.status(), SessionStatus::Authorized);
        assert_eq!(session.role(), Some(Role::User));
        assert_eq!(session.access_token().unwrap().secret(), "fresh");
        assert_eq!(h.provider.silent_calls(), 2);
        assert_eq!(h.directory.calls(), 2);
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_rejected_by_directory_escalates_to_interactive() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::granting("Admin"),
        );
        h.provider.push_silent(Ok(token("revoked")));
        h.provider
            .push_silent(Err(AuthError::interaction_required("AADSTS50173")));
        h.provider.push_login(Ok(LoginResult {
            account: account("alice@contoso.com"),
            access_token: token("interactive"),
        }));
        h.directory
            .push(Err(AuthError::interaction_required("Graph returned HTTP 401")));

        let session = h.manager.initialize().await;

        assert_eq!(h.provider.login_calls(), 1);
        assert_eq!(session.status(), SessionStatus::Authorized);
        assert_eq!(session.access_token().unwrap().secret(), "interactive");
        assert!(!h.manager.interaction_state().is_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_rejected_token_fetches_a_new_one() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::new(Err(AuthError::interaction_required("Graph returned HTTP 401"))),
        );

        let session = h.manager.initialize().await;

        assert_eq!(session.status(), SessionStatus::Unauthorized);
        assert_eq!(
            session.authorization_error().unwrap().reason,
            FailureReason::SignInRequired
        );
        assert_eq!(h.provider.silent_calls(), 2);
        assert_eq!(h.directory.calls(), 2);
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Warning]);

        h.directory
            .set_fallback(Ok(AuthorizationResponse::granted("User")));
        let session = h.manager.retry().await;

        assert_eq!(h.provider.silent_calls(), 3);
        assert_eq!(session.status(), SessionStatus::Authorized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_produce_one_toast() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::new(Err(AuthError::network("offline"))),
        );

        let session = h.manager.initialize().await;

        assert_eq!(h.directory.calls(), 3);
        assert_eq!(session.status(), SessionStatus::Unauthorized);
        let failure = session.authorization_error().unwrap();
        assert_eq!(failure.reason, FailureReason::VerificationFailed);
        assert!(failure.retry_available());
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_clears_credentials_and_capabilities() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::granting("Admin"),
        );
        h.manager.initialize().await;
        assert!(h.manager.session().is_authorized());

        let session = h.manager.sign_out().await;

        assert_eq!(h.provider.logout_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(session.status(), SessionStatus::Unauthorized);
        assert!(session.access_token().is_none());
        assert_eq!(session.role(), None);
        assert_eq!(h.manager.capabilities(), CapabilitySet::default());
        assert_eq!(
            h.notifier.kinds(),
            vec![NotificationKind::Success, NotificationKind::Info]
        );
        assert!(h.manager.access_token().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interactive_sign_in_authorizes() {
        let h = harness(
            FakeProvider::new(AccountScript::Absent),
            FakeDirectory::granting("User"),
        );
        h.provider.push_login(Ok(LoginResult {
            account: account("carol@contoso.com"),
            access_token: token("interactive"),
        }));

        h.manager.initialize().await;
        let session = h.manager.sign_in().await;

        assert_eq!(session.status(), SessionStatus::Authorized);
        assert_eq!(session.access_token().unwrap().secret(), "interactive");
        assert_eq!(h.manager.access_token().await.unwrap().secret(), "interactive");
        assert!(!h.manager.interaction_state().is_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_sign_in_is_silent() {
        let h = harness(
            FakeProvider::new(AccountScript::Absent),
            FakeDirectory::granting("User"),
        );
        h.provider.push_login(Err(AuthError::new(
            AuthErrorKind::UserCancelled,
            "user closed the window",
        )));

        let session = h.manager.sign_in().await;

        assert_eq!(session.status(), SessionStatus::Unauthorized);
        assert_eq!(
            session.authorization_error().unwrap().reason,
            FailureReason::SignInRequired
        );
        assert_eq!(h.notifier.count(), 0);
        assert_eq!(h.directory.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_interactive_sign_in_requires_sign_in() {
        let h = harness(
            FakeProvider::new(AccountScript::Absent),
            FakeDirectory::granting("User"),
        );
        h.provider.set_login_delay(Duration::from_secs(3600));
        let started = Instant::now();

        let session = h.manager.sign_in().await;

        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(session.status(), SessionStatus::Unauthorized);
        let failure = session.authorization_error().unwrap();
        assert_eq!(failure.reason, FailureReason::SignInRequired);
        assert_eq!(
            session.last_error().unwrap().kind,
            AuthErrorKind::TimeoutError
        );
        assert_eq!(h.provider.clear_cache_calls(), 1);
        // Only the serializer's reset warning, not a second failure toast.
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Warning]);
        assert!(!h.manager.interaction_state().is_in_progress());
        assert_eq!(h.directory.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_refresh_token_escalates_to_interactive() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::granting("User"),
        );
        h.provider
            .push_silent(Err(AuthError::interaction_required("AADSTS70043")));
        h.provider.push_login(Ok(LoginResult {
            account: account("alice@contoso.com"),
            access_token: token("fresh"),
        }));

        let session = h.manager.initialize().await;

        assert_eq!(h.provider.login_calls(), 1);
        assert_eq!(session.status(), SessionStatus::Authorized);
        assert_eq!(session.access_token().unwrap().secret(), "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_forces_new_token() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::granting("User"),
        );
        h.provider.push_silent(Ok(token("first")));
        h.provider.push_silent(Ok(token("second")));

        h.manager.initialize().await;
        let session = h.manager.refresh().await;

        assert_eq!(h.provider.silent_calls(), 2);
        assert_eq!(session.access_token().unwrap().secret(), "second");
        assert_eq!(h.directory.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_from_superseded_attempt_is_discarded() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::granting("Admin"),
        );
        h.provider.set_silent_delay(Duration::from_secs(1));

        let (_, after_sign_out) = tokio::join!(h.manager.initialize(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.manager.sign_out().await
        });

        assert_eq!(after_sign_out.status(), SessionStatus::Unauthorized);
        assert_eq!(h.manager.session().status(), SessionStatus::Unauthorized);
        assert!(h.manager.session().access_token().is_none());
        assert_eq!(h.directory.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_invariant_and_ordering_across_transitions() {
        let h = harness(
            FakeProvider::signed_in("alice@contoso.com"),
            FakeDirectory::granting("Admin"),
        );
        assert_role_invariant(&h.manager.session());

        let session = h.manager.initialize().await;
        assert_role_invariant(&session);
        for required in Role::ALL {
            assert!(session.has_role(required));
        }

        h.directory.set_fallback(Ok(AuthorizationResponse::denied()));
        assert_role_invariant(&h.manager.retry().await);

        h.directory
            .set_fallback(Ok(AuthorizationResponse::granted("ReadOnly")));
        let session = h.manager.retry().await;
        assert_role_invariant(&session);
        assert!(session.has_role(Role::ReadOnly));
        assert!(!session.has_role(Role::User));

        assert_role_invariant(&h.manager.sign_out().await);
    }
}
