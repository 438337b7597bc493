//! Push payloads, notifications and notification clicks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

const DEFAULT_TITLE: &str = "Rental Manager";
const DEFAULT_BODY: &str = "You have a new notification";
const DEFAULT_ICON: &str = "/icons/icon-192x192.png";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// Notification to display, built from a push payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub icon: Option<String>,
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
  #[serde(default)]
  pub require_interaction: bool,
  #[serde(default)]
  pub silent: bool,
}

impl Notification {
  /// Build a notification from raw push bytes.
  ///
  /// JSON payloads are used as-is with defaults for missing fields; anything
  /// else becomes the body of a default notification.
  pub fn from_push(payload: &[u8]) -> Self {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();

    if text.is_empty() {
      return Self::text(DEFAULT_BODY);
    }

    match serde_json::from_str::<Value>(text) {
      Ok(Value::Object(mut fields)) => {
        fields
          .entry("title")
          .or_insert_with(|| Value::String(DEFAULT_TITLE.to_string()));
        let mut notification = match serde_json::from_value::<Notification>(Value::Object(fields)) {
          Ok(notification) => notification,
          Err(err) => {
            warn!(error = %err, "malformed push payload, showing it as text");
            return Self::text(text);
          }
        };
        if notification.icon.is_none() {
          notification.icon = Some(DEFAULT_ICON.to_string());
        }
        notification
      }
      _ => Self::text(text),
    }
  }

  fn text(body: &str) -> Self {
    Self {
      title: DEFAULT_TITLE.to_string(),
      body: body.to_string(),
      icon: Some(DEFAULT_ICON.to_string()),
      data: None,
      actions: Vec::new(),
      require_interaction: false,
      silent: false,
    }
  }
}

/// Something that can display notifications.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification);
}

/// Notifier that writes notifications to the log.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn show(&self, notification: &Notification) {
    info!(
      title = %notification.title,
      body = %notification.body,
      actions = notification.actions.len(),
      silent = notification.silent,
      "showing notification"
    );
  }
}

/// A click on a displayed notification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationClick {
  #[serde(default)]
  pub action: Option<String>,
  #[serde(default)]
  pub data: Option<Value>,
}

impl NotificationClick {
  /// Page to open for this click, if any.
  pub fn target(&self, scope: &Url) -> Option<Url> {
    match self.action.as_deref() {
      Some("dismiss") => None,
      Some("view") => {
        let url = self
          .data
          .as_ref()
          .and_then(|d| d.get("url"))
          .and_then(Value::as_str)
          .and_then(|u| scope.join(u).ok());
        Some(url.unwrap_or_else(|| scope.clone()))
      }
      _ => Some(scope.clone()),
    }
  }
}
