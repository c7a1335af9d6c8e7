//! Serialization of interactive sign-in flows.
//!
//! The identity provider rejects a second interactive request while one is
//! open, so every popup/redirect/device-code flow must hold the single
//! process-wide interaction lock. The lock is released when its
//! [`InteractionGuard`] drops, or by a timer if the flow never returns.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared_types::NotificationKind;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionTimeouts;
use crate::error::{AuthError, AuthErrorKind, AuthResult};
use crate::notify::{ArcNotifier, NotifyOptions};
use crate::provider::ArcIdentityProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionState {
    Idle,
    InProgress {
        attempt: Uuid,
        started_at: DateTime<Utc>,
    },
}

impl InteractionState {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, InteractionState::InProgress { .. })
    }
}

/// Process-wide gate for interactive flows. Cheap to clone.
#[derive(Clone)]
pub struct InteractionSerializer {
    inner: Arc<Inner>,
}

struct Inner {
    state: watch::Sender<InteractionState>,
    provider: ArcIdentityProvider,
    notifier: ArcNotifier,
    timeout: Duration,
    poll_attempts: u32,
    poll_interval: Duration,
    timeouts_reported: AtomicU64,
}

impl InteractionSerializer {
    pub fn new(
        provider: ArcIdentityProvider,
        notifier: ArcNotifier,
        timeouts: &SessionTimeouts,
    ) -> Self {
        let (state, _) = watch::channel(InteractionState::Idle);
        Self {
            inner: Arc::new(Inner {
                state,
                provider,
                notifier,
                timeout: timeouts.interaction_timeout,
                poll_attempts: timeouts.interaction_poll_attempts,
                poll_interval: timeouts.interaction_poll_interval,
                timeouts_reported: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> InteractionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_in_progress(&self) -> bool {
        self.inner.state.borrow().is_in_progress()
    }

    pub fn subscribe(&self) -> watch::Receiver<InteractionState> {
        self.inner.state.subscribe()
    }

    /// Number of timed-out interactions the user has already been told about.
    pub fn timeouts_reported(&self) -> u64 {
        self.inner.timeouts_reported.load(Ordering::SeqCst)
    }

    /// Take the interaction lock, or fail fast with `InteractionInProgress`.
    ///
    /// Must be called from within a tokio runtime: the lock arms a timer
    /// that force-releases it after the interaction timeout.
    pub fn begin_interaction(&self) -> AuthResult<InteractionGuard> {
        let attempt = Uuid::new_v4();
        let started_at = Utc::now();

        let acquired = self.inner.state.send_if_modified(|state| match state {
            InteractionState::Idle => {
                *state = InteractionState::InProgress {
                    attempt,
                    started_at,
                };
                true
            }
            InteractionState::InProgress { .. } => false,
        });

        if !acquired {
            return Err(AuthError::interaction_in_progress(
                "an interactive sign-in is already running",
            ));
        }

        tracing::debug!("Interaction {} started", attempt);
        let timer = tokio::spawn(self.clone().expire_after_timeout(attempt)).abort_handle();

        Ok(InteractionGuard {
            serializer: self.clone(),
            attempt,
            timer,
        })
    }

    /// Release the lock only if it is still held by `attempt`.
    fn release(&self, attempt: Uuid) -> bool {
        self.inner.state.send_if_modified(|state| match state {
            InteractionState::InProgress { attempt: held, .. } if *held == attempt => {
                *state = InteractionState::Idle;
                true
            }
            _ => false,
        })
    }

    async fn expire_after_timeout(self, attempt: Uuid) {
        tokio::time::sleep(self.inner.timeout).await;

        if self.release(attempt) {
            self.recover_from_timeout(attempt).await;
        }
    }

    /// Reset the provider after `attempt` overran the interaction timeout.
    /// Callers must have released the lock for `attempt` themselves, so a
    /// timeout is recovered from exactly once.
    async fn recover_from_timeout(&self, attempt: Uuid) {
        tracing::warn!(
            "Interaction {} did not finish within {:?}, releasing lock and clearing provider cache",
            attempt,
            self.inner.timeout
        );
        self.inner.provider.clear_cache().await;
        self.inner.timeouts_reported.fetch_add(1, Ordering::SeqCst);
        self.inner.notifier.notify(
            NotificationKind::Warning,
            "Sign-in took too long and was reset. Please try again.",
            NotifyOptions::sticky("interaction-timeout"),
        );
    }

    /// Drop the lock regardless of owner and clear the provider's
    /// interaction bookkeeping.
    pub async fn force_clear(&self, reason: &str) {
        let previous = self.inner.state.send_replace(InteractionState::Idle);
        tracing::warn!(
            "Force-clearing interaction state ({}), previous state: {:?}",
            reason,
            previous
        );
        self.inner.provider.clear_cache().await;
    }

    /// Poll until the lock is free. After the bounded number of polls the
    /// lock is force-cleared and `InteractionInProgress` is returned.
    pub async fn wait_for_release(&self, cancel: &CancellationToken) -> AuthResult<()> {
        for attempt in 1..=self.inner.poll_attempts {
            if !self.is_in_progress() {
                return Ok(());
            }
            tracing::debug!(
                "Waiting for interaction lock ({}/{})",
                attempt,
                self.inner.poll_attempts
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(AuthError::cancelled()),
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }

        if !self.is_in_progress() {
            return Ok(());
        }

        self.force_clear("interaction lock never released").await;
        Err(AuthError::interaction_in_progress(format!(
            "interaction still in progress after {} checks; state was reset",
            self.inner.poll_attempts
        )))
    }

    /// Run `flow` while holding the interaction lock.
    ///
    /// A busy lock, or a provider reporting its own interaction as still
    /// open, is waited out and the flow retried once. The flow itself is
    /// bounded by the interaction timeout.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut flow: F) -> AuthResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AuthResult<T>>,
    {
        let mut retried = false;

        loop {
            let guard = match self.begin_interaction() {
                Ok(guard) => guard,
                Err(_) if !retried => {
                    self.wait_for_release(cancel).await?;
                    retried = true;
                    continue;
                }
                Err(err) => {
                    self.force_clear("interaction lock still held after retry").await;
                    return Err(err);
                }
            };

            let timeout = self.inner.timeout;
            let (outcome, timed_out) = tokio::select! {
                _ = cancel.cancelled() => (Err(AuthError::cancelled()), false),
                result = tokio::time::timeout(timeout, flow()) => match result {
                    Ok(result) => (result, false),
                    Err(_) => (
                        Err(AuthError::timeout(format!(
                            "interactive sign-in did not complete within {:?}",
                            timeout
                        ))),
                        true,
                    ),
                },
            };
            let attempt = guard.attempt();
            // False when the expiry timer got there first and already recovered.
            if guard.end() && timed_out {
                self.recover_from_timeout(attempt).await;
            }

            match outcome {
                Err(err) if err.kind == AuthErrorKind::InteractionInProgress && !retried => {
                    tracing::warn!(
                        "Identity provider reports an interaction already open, clearing and retrying once"
                    );
                    self.inner.provider.clear_cache().await;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AuthError::cancelled()),
                        _ = tokio::time::sleep(self.inner.poll_interval) => {}
                    }
                    retried = true;
                }
                other => return other,
            }
        }
    }
}

/// Holds the interaction lock; releases it on drop.
#[must_use = "the interaction lock is released as soon as the guard is dropped"]
pub struct InteractionGuard {
    serializer: InteractionSerializer,
    attempt: Uuid,
    timer: AbortHandle,
}

impl InteractionGuard {
    pub fn attempt(&self) -> Uuid {
        self.attempt
    }

    /// Release the lock explicitly. Returns false if the lock had already
    /// been released by the expiry timer or a force-clear.
    pub fn end(mut self) -> bool {
        self.finish()
    }

    fn finish(&mut self) -> bool {
        self.timer.abort();
        let released = self.serializer.release(self.attempt);
        if released {
            tracing::debug!("Interaction {} ended", self.attempt);
        }
        released
    }
}

impl std::fmt::Debug for InteractionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionGuard")
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl Drop for InteractionGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{timeouts, AccountScript, FakeProvider, RecordingNotifier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn serializer() -> (InteractionSerializer, Arc<FakeProvider>, Arc<RecordingNotifier>) {
        let provider = FakeProvider::new(AccountScript::Absent);
        let notifier = RecordingNotifier::new();
        let serializer = InteractionSerializer::new(provider.clone(), notifier.clone(), &timeouts());
        (serializer, provider, notifier)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_begin_fails_fast() {
        let (serializer, _, _) = serializer();

        let guard = assert_ok!(serializer.begin_interaction());
        assert!(serializer.is_in_progress());

        let err = assert_err!(serializer.begin_interaction());
        assert_eq!(err.kind, AuthErrorKind::InteractionInProgress);

        drop(guard);
        assert!(!serializer.is_in_progress());
        assert_ok!(serializer.begin_interaction());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_end_releases_lock() {
        let (serializer, provider, notifier) = serializer();

        let guard = serializer.begin_interaction().unwrap();
        assert!(guard.end());
        assert_eq!(serializer.state(), InteractionState::Idle);

        // The disarmed timer must not fire later.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(provider.clear_cache_calls(), 0);
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_auto_releases_after_timeout() {
        let (serializer, provider, notifier) = serializer();

        // Simulates a popup that never returns: the guard is never dropped.
        let hung = serializer.begin_interaction().unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(serializer.is_in_progress());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!serializer.is_in_progress());
        assert_eq!(provider.clear_cache_calls(), 1);
        assert_eq!(notifier.kinds(), vec![NotificationKind::Warning]);

        // A new attempt may start, and the stale guard cannot release it.
        let fresh = serializer.begin_interaction().unwrap();
        drop(hung);
        assert!(serializer.is_in_progress());
        drop(fresh);
        assert!(!serializer.is_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_never_starts_second_flow_while_locked() {
        let (serializer, provider, _) = serializer();
        let held = serializer.begin_interaction().unwrap();
        let flows = AtomicUsize::new(0);
        let counter = &flows;
        let cancel = CancellationToken::new();

        let result = serializer
            .run(&cancel, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        // 30 polls at 1s elapse before the 60s timer, so the waiter gives up
        // and force-clears without ever invoking the flow.
        let err = result.unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InteractionInProgress);
        assert_eq!(flows.load(Ordering::SeqCst), 0);
        assert!(!serializer.is_in_progress());
        assert_eq!(provider.clear_cache_calls(), 1);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_for_release_then_retries_once() {
        let (serializer, _, _) = serializer();
        let held = serializer.begin_interaction().unwrap();
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(held);
        });

        let flows = AtomicUsize::new(0);
        let counter = &flows;
        let value = serializer
            .run(&cancel, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(flows.load(Ordering::SeqCst), 1);
        assert!(!serializer.is_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_once_when_provider_reports_busy() {
        let (serializer, provider, _) = serializer();
        let cancel = CancellationToken::new();
        let flows = AtomicUsize::new(0);

        let value = serializer
            .run(&cancel, || {
                let call = flows.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(AuthError::interaction_in_progress("provider busy"))
                    } else {
                        Ok("token")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "token");
        assert_eq!(flows.load(Ordering::SeqCst), 2);
        assert_eq!(provider.clear_cache_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_hung_flow() {
        let (serializer, provider, notifier) = serializer();
        let cancel = CancellationToken::new();

        let err = serializer
            .run(&cancel, || std::future::pending::<AuthResult<()>>())
            .await
            .unwrap_err();

        assert_eq!(err.kind, AuthErrorKind::TimeoutError);
        assert!(!serializer.is_in_progress());
        assert_eq!(provider.clear_cache_calls(), 1);
        assert_eq!(notifier.kinds(), vec![NotificationKind::Warning]);
        assert_eq!(serializer.timeouts_reported(), 1);

        // The disarmed timer must not recover a second time.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(provider.clear_cache_calls(), 1);
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_guard_end_reports_not_released() {
        let (serializer, _, _) = serializer();
        let hung = serializer.begin_interaction().unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(!hung.end());
        assert_eq!(serializer.timeouts_reported(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_release_honours_cancellation() {
        let (serializer, _, _) = serializer();
        let _held = serializer.begin_interaction().unwrap();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let err = serializer.wait_for_release(&cancel).await.unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::Cancelled);
        assert!(serializer.is_in_progress());
    }
}
