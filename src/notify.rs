//! User-facing notifications.
//!
//! Failures that reach a caller-facing boundary are turned into one declarative
//! [`Notification`] each, so status surfaces can show them next to the log.

use crate::error::SyncError;
use crate::scheduler::SyncDirection;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub cause: Option<String>,
    pub direction: SyncDirection,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
            cause: None,
            direction: SyncDirection::None,
            timestamp: Utc::now(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            ..Self::info(message)
        }
    }

    /// Error notification whose text names the direction that failed.
    pub fn failure(
        direction: SyncDirection,
        message: impl Into<String>,
        cause: &SyncError,
    ) -> Self {
        let message = message.into();
        let message = match direction {
            SyncDirection::LocalToRemote => {
                format!("Synchronization to the remote store failed: {message}")
            }
            SyncDirection::RemoteToLocal => {
                format!("Synchronization from the remote store failed: {message}")
            }
            SyncDirection::None => message,
        };
        Self {
            level: NotificationLevel::Error,
            message,
            cause: Some(cause.to_string()),
            direction,
            timestamp: Utc::now(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sends notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        let cause = notification.cause.as_deref().unwrap_or("");
        match notification.level {
            NotificationLevel::Info => {
                info!(direction = ?notification.direction, "{}", notification.message)
            }
            NotificationLevel::Warning => {
                warn!(direction = ?notification.direction, cause, "{}", notification.message)
            }
            NotificationLevel::Error => {
                error!(direction = ?notification.direction, cause, "{}", notification.message)
            }
        }
    }
}

/// Keeps every notification in memory and forwards it to the log.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn errors(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .iter()
            .filter(|n| n.level == NotificationLevel::Error)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.notifications.lock().clear();
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notification: Notification) {
        LogNotifier.notify(notification.clone());
        self.notifications.lock().push(notification);
    }
}
