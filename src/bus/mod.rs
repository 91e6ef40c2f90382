//! Pub/sub glue between supervisors and viewers.
//!
//! Each session has two channels: `session:<id>:events` (supervisor
//! publishes sequenced events) and `session:<id>:control` (viewers publish
//! control messages). Dropping a [`Subscription`] unsubscribes it.

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Result;

pub mod local;

/// Channel carrying the sequenced events of a session.
#[must_use]
pub fn events_channel(session_id: &str) -> String {
    format!("session:{session_id}:events")
}

/// Channel carrying inbound control messages for a session.
#[must_use]
pub fn control_channel(session_id: &str) -> String {
    format!("session:{session_id}:control")
}

/// Publish/subscribe transport.
pub trait EventBus: Send + Sync {
    /// Publish `payload` to every current subscriber of `channel`.
    fn publish<'a>(&'a self, channel: &'a str, payload: Value) -> BoxFuture<'a, Result<()>>;

    /// Subscribe to `channel`. Messages published before the call are not
    /// delivered.
    fn subscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<Subscription>>;
}

/// Live subscription to one channel.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// Wrap the receiving half handed out by a bus implementation.
    #[must_use]
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    /// Channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message; `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Next already-delivered message, without waiting.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}
