//! Notification collaborator used to surface session changes to the user.

use std::sync::Arc;
use std::time::Duration;

use shared_types::NotificationKind;

/// Presentation hints for a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyOptions {
    /// Close automatically after this long. `None` keeps it until dismissed.
    pub auto_close: Option<Duration>,
    /// Replaces any visible notification with the same id.
    pub toast_id: Option<String>,
}

impl NotifyOptions {
    pub fn auto_close(duration: Duration) -> Self {
        Self {
            auto_close: Some(duration),
            toast_id: None,
        }
    }

    pub fn sticky(toast_id: impl Into<String>) -> Self {
        Self {
            auto_close: None,
            toast_id: Some(toast_id.into()),
        }
    }
}

pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, kind: NotificationKind, message: &str, options: NotifyOptions);
}

pub type ArcNotifier = Arc<dyn Notifier>;

/// Notifier that writes every notification to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, kind: NotificationKind, message: &str, _options: NotifyOptions) {
        match kind {
            NotificationKind::Error => tracing::error!("[notify] {}", message),
            NotificationKind::Warning => tracing::warn!("[notify] {}", message),
            NotificationKind::Success | NotificationKind::Info => {
                tracing::info!("[notify] {}", message)
            }
        }
    }
}
