//! Status notifications delivered to the registered observer.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// A status line, optionally paired with a completion percentage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Human-readable status.
    pub status: String,
    /// Percentage in `0..=100`, or `None` when progress is unknown.
    pub progress: Option<u8>,
}

impl Notification {
    /// Status without progress.
    #[must_use]
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            progress: None,
        }
    }

    /// Status with a percentage.
    #[must_use]
    pub fn progress(status: impl Into<String>, percent: u8) -> Self {
        Self {
            status: status.into(),
            progress: Some(percent.min(100)),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.progress {
            Some(p) => write!(f, "{} ({p}%)", self.status),
            None => f.write_str(&self.status),
        }
    }
}

/// Observer callback invoked for every notification.
pub type Observer = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Deliver a notification to an optional observer.
///
/// A panicking observer is logged and otherwise ignored. This relies on
/// unwinding: under `panic = "abort"` (the release profile) an observer
/// panic still terminates the process, so observers must not panic there.
pub fn notify(observer: Option<&Observer>, notification: &Notification) {
    let Some(observer) = observer else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| observer(notification))).is_err() {
        warn!("Observer panicked while handling {:?}", notification.status);
    }
}

/// Channel for receiving notifications.
pub type NotificationChannel = broadcast::Receiver<Notification>;

/// Sender for notifications.
pub type NotificationSender = broadcast::Sender<Notification>;

/// Create a new notification channel pair.
#[must_use]
pub fn create_event_channel() -> (NotificationSender, NotificationChannel) {
    broadcast::channel(256)
}

/// Observer that forwards every notification into a broadcast channel.
#[must_use]
pub fn channel_observer(tx: NotificationSender) -> Observer {
    Arc::new(move |n: &Notification| {
        let _ = tx.send(n.clone());
    })
}
