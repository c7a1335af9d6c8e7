//! Error taxonomy for the authentication layer.
//!
//! Every failure coming out of the identity provider, the directory or the
//! local timeouts is classified into a closed [`AuthErrorKind`]. Retry and
//! escalation decisions are made by matching on the kind, never on message
//! text.

use thiserror::Error;

/// Classification of an authentication or authorization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorKind {
    /// The user closed or dismissed the interactive flow.
    UserCancelled,
    /// The browser refused to open the interactive window.
    PopupBlocked,
    NetworkError,
    TimeoutError,
    ServerError,
    /// Another interactive flow is already running.
    InteractionInProgress,
    /// Silent acquisition is impossible; an interactive flow must run.
    InteractionRequired,
    /// The user or tenant has not consented to the requested scopes.
    ConsentRequired,
    /// The directory explicitly refused this user.
    AuthorizationDenied,
    /// The caller lost interest before the operation completed.
    Cancelled,
    Unknown,
}

impl AuthErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            AuthErrorKind::UserCancelled => "user_cancelled",
            AuthErrorKind::PopupBlocked => "popup_blocked",
            AuthErrorKind::NetworkError => "network_error",
            AuthErrorKind::TimeoutError => "timeout_error",
            AuthErrorKind::ServerError => "server_error",
            AuthErrorKind::InteractionInProgress => "interaction_in_progress",
            AuthErrorKind::InteractionRequired => "interaction_required",
            AuthErrorKind::ConsentRequired => "consent_required",
            AuthErrorKind::AuthorizationDenied => "authorization_denied",
            AuthErrorKind::Cancelled => "cancelled",
            AuthErrorKind::Unknown => "unknown",
        }
    }

    /// Transient failures that may succeed when repeated after a delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthErrorKind::NetworkError | AuthErrorKind::TimeoutError | AuthErrorKind::ServerError => {
                true
            }
            AuthErrorKind::UserCancelled
            | AuthErrorKind::PopupBlocked
            | AuthErrorKind::InteractionInProgress
            | AuthErrorKind::InteractionRequired
            | AuthErrorKind::ConsentRequired
            | AuthErrorKind::AuthorizationDenied
            | AuthErrorKind::Cancelled
            | AuthErrorKind::Unknown => false,
        }
    }

    /// Silent failures that must be escalated to an interactive flow.
    pub fn requires_interaction(&self) -> bool {
        matches!(
            self,
            AuthErrorKind::InteractionRequired | AuthErrorKind::ConsentRequired
        )
    }

    /// Failures that are not worth a notification.
    pub fn is_silent(&self) -> bool {
        matches!(self, AuthErrorKind::UserCancelled | AuthErrorKind::Cancelled)
    }
}

impl std::fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure with free-form detail for logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub detail: String,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::NetworkError, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::TimeoutError, detail)
    }

    pub fn server(detail: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::ServerError, detail)
    }

    pub fn interaction_in_progress(detail: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InteractionInProgress, detail)
    }

    pub fn interaction_required(detail: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InteractionRequired, detail)
    }

    pub fn denied(detail: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::AuthorizationDenied, detail)
    }

    pub fn cancelled() -> Self {
        Self::new(AuthErrorKind::Cancelled, "operation cancelled")
    }

    pub fn unknown(detail: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Unknown, detail)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn requires_interaction(&self) -> bool {
        self.kind.requires_interaction()
    }

    /// Message suitable for display to the signed-in user.
    pub fn user_message(&self) -> String {
        match self.kind {
            AuthErrorKind::UserCancelled => "Sign-in was cancelled.".to_string(),
            AuthErrorKind::PopupBlocked => {
                "The sign-in window was blocked. Allow popups for this site and try again."
                    .to_string()
            }
            AuthErrorKind::NetworkError => {
                "Could not reach the sign-in service. Check your connection and try again."
                    .to_string()
            }
            AuthErrorKind::TimeoutError => {
                "The sign-in service did not respond in time. Please try again.".to_string()
            }
            AuthErrorKind::ServerError => {
                "The sign-in service is temporarily unavailable. Please try again shortly."
                    .to_string()
            }
            AuthErrorKind::InteractionInProgress => {
                "Another sign-in is already in progress. Finish or close it, then try again."
                    .to_string()
            }
            AuthErrorKind::InteractionRequired | AuthErrorKind::ConsentRequired => {
                "Please sign in again to continue.".to_string()
            }
            AuthErrorKind::AuthorizationDenied => {
                "Your account is not authorized to use this application. Contact an administrator to request access."
                    .to_string()
            }
            AuthErrorKind::Cancelled => "The request was cancelled.".to_string(),
            AuthErrorKind::Unknown => format!("Authentication failed: {}", self.detail),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return AuthError::timeout(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() {
                return AuthError::server(err.to_string());
            }
        }
        if err.is_connect() || err.is_request() {
            return AuthError::network(err.to_string());
        }
        AuthError::unknown(err.to_string())
    }
}

/// Result type alias for the authentication layer
pub type AuthResult<T> = Result<T, AuthError>;

/// Startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable must be set")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
