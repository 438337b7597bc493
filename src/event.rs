use bytes::Bytes;
use color_eyre::Result;
use serde::Deserialize;
use tokio::task::JoinHandle;
use url::Url;

use crate::cache::Served;
use crate::net::Request;
use crate::worker::push::NotificationClick;
use crate::worker::queue::ReplayReport;

/// Events delivered to the registration by the host
#[derive(Debug)]
pub enum WorkerEvent {
  /// A new version should be installed
  Install { version: String },
  /// A page made a request
  Fetch(Request),
  /// A page posted a message
  Message(ClientMessage),
  /// Raw payload from the push service
  Push(Bytes),
  /// The user clicked a notification
  NotificationClick(NotificationClick),
  /// Connectivity is back for the given tag
  Sync { tag: String },
}

/// Messages pages can post to the worker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate the waiting version now
  SkipWaiting,
  #[serde(other)]
  Unknown,
}

/// What the host should do after an event was handled
#[derive(Debug)]
pub enum EventOutcome {
  /// Answer the page with this response
  Respond(Served),
  /// Not for the worker; the host applies its default behavior
  Ignore,
  /// Done, nothing further to deliver
  Handled,
  /// Open (or focus) a page at this URL
  OpenWindow(Url),
  /// Work continues in the background; await to keep it alive
  Deferred(JoinHandle<Result<ReplayReport>>),
}
