//! Session value and its owned store.
//!
//! The store is the only place a [`Session`] is mutated. Every transition
//! keeps `role.is_some() == (status == Authorized)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared_types::{CapabilitySet, Role, SessionStatus, UserIdentity};
use tokio::sync::watch;

use crate::error::{AuthError, AuthErrorKind};
use crate::provider::AccessToken;

/// Why a session is unauthorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The allow-list refused the user. Needs administrator action.
    Denied,
    /// The check itself failed; retrying may succeed.
    VerificationFailed,
    /// No usable sign-in exists.
    SignInRequired,
}

/// Which step of an authorization attempt produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Obtaining an account and token, silently or interactively.
    SignIn,
    /// Checking the signed-in user against the allow-list.
    Verification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl AuthorizationFailure {
    pub fn denied(email: &str) -> Self {
        Self {
            reason: FailureReason::Denied,
            message: format!(
                "Access denied: {} is not authorized to use this application. Contact an administrator to request access.",
                email
            ),
        }
    }

    pub fn sign_in_required(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::SignInRequired,
            message: message.into(),
        }
    }

    /// Build the failure shown for an error that ended an authorization attempt.
    ///
    /// Transient errors only count as a failed verification once a sign-in
    /// exists; before that the user still has to sign in.
    pub fn from_error(err: &AuthError, stage: FailureStage) -> Self {
        let reason = match err.kind {
            AuthErrorKind::AuthorizationDenied => FailureReason::Denied,
            _ if stage == FailureStage::SignIn => FailureReason::SignInRequired,
            AuthErrorKind::NetworkError
            | AuthErrorKind::TimeoutError
            | AuthErrorKind::ServerError
            | AuthErrorKind::Unknown => FailureReason::VerificationFailed,
            AuthErrorKind::UserCancelled
            | AuthErrorKind::PopupBlocked
            | AuthErrorKind::InteractionInProgress
            | AuthErrorKind::InteractionRequired
            | AuthErrorKind::ConsentRequired
            | AuthErrorKind::Cancelled => FailureReason::SignInRequired,
        };

        let message = match reason {
            FailureReason::VerificationFailed => format!(
                "We couldn't verify your access. {} Use retry to check again.",
                err.user_message()
            ),
            FailureReason::Denied | FailureReason::SignInRequired => err.user_message(),
        };

        Self { reason, message }
    }

    /// True when a retry without administrator involvement may succeed.
    pub fn retry_available(&self) -> bool {
        matches!(
            self.reason,
            FailureReason::VerificationFailed | FailureReason::SignInRequired
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    status: SessionStatus,
    user: Option<UserIdentity>,
    access_token: Option<AccessToken>,
    role: Option<Role>,
    last_error: Option<AuthError>,
    authorization_error: Option<AuthorizationFailure>,
    updated_at: DateTime<Utc>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            status: SessionStatus::Loading,
            user: None,
            access_token: None,
            role: None,
            last_error: None,
            authorization_error: None,
            updated_at: Utc::now(),
        }
    }
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.as_ref()
    }

    pub fn access_token(&self) -> Option<&AccessToken> {
        self.access_token.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn last_error(&self) -> Option<&AuthError> {
        self.last_error.as_ref()
    }

    pub fn authorization_error(&self) -> Option<&AuthorizationFailure> {
        self.authorization_error.as_ref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_authorized(&self) -> bool {
        self.status == SessionStatus::Authorized
    }

    pub fn is_loading(&self) -> bool {
        self.status == SessionStatus::Loading
    }

    /// True when the session holds at least `required`.
    pub fn has_role(&self, required: Role) -> bool {
        self.role.is_some_and(|role| role.has_role(required))
    }

    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::for_role(self.role)
    }

    fn holds_invariant(&self) -> bool {
        self.role.is_some() == (self.status == SessionStatus::Authorized)
    }
}

/// Generation marker issued by every transition into `Loading`.
///
/// Results carrying an older ticket belong to a superseded attempt and
/// are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// Owner of the single session value. Cheap to clone.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    session: watch::Sender<Session>,
    generation: AtomicU64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (session, _) = watch::channel(Session::default());
        Self {
            inner: Arc::new(StoreInner {
                session,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.inner.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.inner.session.subscribe()
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == ticket.0
    }

    fn next_ticket(&self) -> Ticket {
        Ticket(self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn update(&self, apply: impl FnOnce(&mut Session)) {
        self.inner.session.send_modify(|session| {
            apply(session);
            session.updated_at = Utc::now();
            debug_assert!(session.holds_invariant(), "role set outside Authorized");
        });
    }

    /// Enter `Loading`. Role and authorization error are cleared; the
    /// current token and user are kept for re-validation.
    pub fn begin_loading(&self) -> Ticket {
        let ticket = self.next_ticket();
        self.update(|session| {
            session.status = SessionStatus::Loading;
            session.role = None;
            session.authorization_error = None;
        });
        tracing::debug!("Session loading (generation {})", ticket.0);
        ticket
    }

    /// Enter `Authorized`. Returns false if `ticket` is stale.
    pub fn authorize(
        &self,
        ticket: Ticket,
        user: UserIdentity,
        token: AccessToken,
        role: Role,
    ) -> bool {
        if !self.is_current(ticket) {
            tracing::debug!("Discarding stale authorization for {}", user.email);
            return false;
        }
        tracing::info!("Session authorized for {} as {}", user.email, role);
        self.update(|session| {
            session.status = SessionStatus::Authorized;
            session.user = Some(user);
            session.access_token = Some(token);
            session.role = Some(role);
            session.last_error = None;
            session.authorization_error = None;
        });
        true
    }

    /// Enter `Unauthorized`, clearing token and role. Returns false if
    /// `ticket` is stale.
    pub fn reject(
        &self,
        ticket: Ticket,
        user: Option<UserIdentity>,
        failure: AuthorizationFailure,
        error: Option<AuthError>,
    ) -> bool {
        if !self.is_current(ticket) {
            tracing::debug!("Discarding stale rejection: {}", failure.message);
            return false;
        }
        tracing::info!("Session unauthorized ({:?}): {}", failure.reason, failure.message);
        self.update(|session| {
            session.status = SessionStatus::Unauthorized;
            session.user = user;
            session.access_token = None;
            session.role = None;
            if error.is_some() {
                session.last_error = error;
            }
            session.authorization_error = Some(failure);
        });
        true
    }

    /// Record a freshly acquired token without changing status. Ignored
    /// while unauthorized, since entering that state revokes the token.
    pub fn record_token(&self, token: AccessToken) {
        self.inner.session.send_if_modified(|session| {
            if session.status == SessionStatus::Unauthorized {
                return false;
            }
            session.access_token = Some(token);
            session.updated_at = Utc::now();
            true
        });
    }

    /// Record a failure without changing status.
    pub fn record_error(&self, error: AuthError) {
        self.update(|session| session.last_error = Some(error));
    }

    /// Return to the initial `Loading` state with nothing set.
    pub fn reset(&self) -> Ticket {
        let ticket = self.next_ticket();
        self.inner.session.send_replace(Session::default());
        tracing::debug!("Session reset (generation {})", ticket.0);
        ticket
    }
}
