//! In-process event bus with bounded per-channel replay history.

use std::collections::{HashMap, VecDeque};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{EventBus, Subscription};
use crate::Result;

/// Messages retained per channel for late viewers.
pub const DEFAULT_HISTORY: usize = 1000;

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<mpsc::UnboundedSender<Value>>,
    history: VecDeque<Value>,
}

/// Bus implementation backed by unbounded `mpsc` fan-out.
pub struct LocalBus {
    channels: Mutex<HashMap<String, ChannelState>>,
    history_limit: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl LocalBus {
    /// Create a bus keeping at most `history_limit` messages per channel.
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            history_limit,
        }
    }

    /// Messages retained for `channel`, oldest first.
    pub async fn history(&self, channel: &str) -> Vec<Value> {
        let channels = self.channels.lock().await;
        channels
            .get(channel)
            .map(|state| state.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained events on `channel` whose `seq` is greater than `after_seq`.
    ///
    /// Lets a viewer that reconnects catch up before consuming its live
    /// subscription.
    pub async fn events_since(&self, channel: &str, after_seq: u64) -> Vec<Value> {
        self.history(channel)
            .await
            .into_iter()
            .filter(|event| {
                event
                    .get("seq")
                    .and_then(Value::as_u64)
                    .is_some_and(|seq| seq > after_seq)
            })
            .collect()
    }

    /// Number of live subscribers on `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().await;
        channels
            .get(channel)
            .map_or(0, |state| {
                state.subscribers.iter().filter(|tx| !tx.is_closed()).count()
            })
    }
}

impl EventBus for LocalBus {
    fn publish<'a>(&'a self, channel: &'a str, payload: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut channels = self.channels.lock().await;
            let state = channels.entry(channel.to_owned()).or_default();

            state
                .subscribers
                .retain(|tx| tx.send(payload.clone()).is_ok());

            if self.history_limit > 0 {
                if state.history.len() == self.history_limit {
                    state.history.pop_front();
                }
                state.history.push_back(payload);
            }

            debug!(channel, subscribers = state.subscribers.len(), "published");
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<Subscription>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut channels = self.channels.lock().await;
            channels
                .entry(channel.to_owned())
                .or_default()
                .subscribers
                .push(tx);
            Ok(Subscription::new(channel, rx))
        })
    }
}
