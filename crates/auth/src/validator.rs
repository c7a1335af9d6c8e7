//! Allow-list validation with bounded retry on transient failures.

use shared_types::Role;
use tokio_util::sync::CancellationToken;

use crate::config::SessionTimeouts;
use crate::directory::ArcDirectory;
use crate::error::{AuthError, AuthResult};
use crate::provider::AccessToken;

/// Outcome of an allow-list lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorization {
    pub authorized: bool,
    /// Set iff `authorized`.
    pub role: Option<Role>,
}

pub struct AuthorizationValidator {
    directory: ArcDirectory,
    timeouts: SessionTimeouts,
}

impl AuthorizationValidator {
    pub fn new(directory: ArcDirectory, timeouts: &SessionTimeouts) -> Self {
        Self {
            directory,
            timeouts: timeouts.clone(),
        }
    }

    /// Look up `email` in the allow-list.
    ///
    /// Network, timeout and server failures are retried up to the
    /// configured attempt count with doubling backoff. An explicit denial,
    /// whether as `is_authorized = false` or an `AuthorizationDenied`
    /// error, returns immediately.
    pub async fn validate(
        &self,
        token: &AccessToken,
        email: &str,
        cancel: &CancellationToken,
    ) -> AuthResult<Authorization> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(AuthError::unknown(
                "cannot check authorization without an email address",
            ));
        }

        let max_attempts = self.timeouts.validation_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(AuthError::cancelled());
            }

            let lookup = tokio::time::timeout(
                self.timeouts.request_timeout,
                self.directory.is_user_authorized(token, &email),
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AuthError::cancelled()),
                result = lookup => result.unwrap_or_else(|_| {
                    Err(AuthError::timeout(format!(
                        "directory lookup did not respond within {:?}",
                        self.timeouts.request_timeout
                    )))
                }),
            };

            match result {
                Ok(response) => {
                    let role = response.resolved_role();
                    tracing::info!(
                        "Authorization check for {}: authorized={}, role={:?}",
                        email,
                        response.is_authorized,
                        role
                    );
                    return Ok(Authorization {
                        authorized: response.is_authorized,
                        role,
                    });
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.timeouts.backoff_after(attempt);
                    tracing::warn!(
                        "Authorization check attempt {}/{} for {} failed ({}), retrying in {:?}",
                        attempt,
                        max_attempts,
                        email,
                        err,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AuthError::cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) if err.is_retryable() => {
                    tracing::error!(
                        "Authorization check for {} failed after {} attempts: {}",
                        email,
                        attempt,
                        err
                    );
                    return Err(AuthError::new(
                        err.kind,
                        format!(
                            "authorization check failed after multiple attempts ({}): {}",
                            attempt, err.detail
                        ),
                    ));
                }
                Err(err) => {
                    tracing::warn!("Authorization check for {} failed: {}", email, err);
                    return Err(err);
                }
            }
        }
    }
}
