//! In-Memory Change Stream
//!
//! In-process [`ChangeStreamPort`] for tests, demos and local development.
//! Channels are plain mpsc senders; [`InMemoryChangeStream::publish`] routes a
//! change to every open channel whose bindings and filter match, the same way
//! a Realtime server would.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    ChangeStreamError, ChangeStreamPort, ChannelEvent, ChannelRequest, ChannelStatus,
    ChannelSubscription, RawChange,
};

const CHANNEL_BUFFER: usize = 1_024;

struct OpenChannel {
    request: ChannelRequest,
    tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
}

impl OpenChannel {
    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    fn accepts(&self, change: &RawChange) -> bool {
        let bound = self
            .request
            .bindings
            .iter()
            .any(|binding| binding.table == change.table && binding.event == change.kind);

        bound
            && self.request.filter.matches(
                &column(&change.record, "user_id"),
                &column(&change.record, "course_id"),
            )
    }
}

fn column(record: &Value, name: &str) -> String {
    match record.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[derive(Default)]
struct Inner {
    channels: Vec<OpenChannel>,
    requests: Vec<ChannelRequest>,
    failures: VecDeque<ChangeStreamError>,
    manual_ack: bool,
}

impl Inner {
    fn prune(&mut self) {
        self.channels.retain(OpenChannel::is_open);
    }
}

/// In-process change stream.
///
/// Cloning shares the same set of channels.
#[derive(Clone, Default)]
pub struct InMemoryChangeStream {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for InMemoryChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChangeStream")
            .field("open_channels", &self.open_channels())
            .finish_non_exhaustive()
    }
}

impl InMemoryChangeStream {
    /// Create a stream that acknowledges joins immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stream that leaves joins pending until
    /// [`send_status`](Self::send_status) is called.
    #[must_use]
    pub fn with_manual_ack() -> Self {
        let stream = Self::default();
        stream.inner.lock().manual_ack = true;
        stream
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscriptions(&self, count: usize, error: &ChangeStreamError) {
        let mut inner = self.inner.lock();
        for _ in 0..count {
            inner.failures.push_back(error.clone());
        }
    }

    /// Every channel request received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ChannelRequest> {
        self.inner.lock().requests.clone()
    }

    /// Number of channels that are still open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.prune();
        inner.channels.len()
    }

    /// Route a change to every matching channel. Returns the match count.
    pub fn publish(&self, change: &RawChange) -> usize {
        let mut inner = self.inner.lock();
        inner.prune();

        let mut delivered = 0;
        for channel in inner.channels.iter().filter(|c| c.accepts(change)) {
            match channel.tx.try_send(ChannelEvent::Change(change.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(topic = %channel.request.topic, error = %e, "In-memory channel full");
                }
            }
        }
        delivered
    }

    /// Push a status to every open channel on `topic`. Returns the match count.
    pub fn send_status(&self, topic: &str, status: &ChannelStatus) -> usize {
        let mut inner = self.inner.lock();
        inner.prune();

        inner
            .channels
            .iter()
            .filter(|c| c.request.topic == topic)
            .filter(|c| c.tx.try_send(ChannelEvent::Status(status.clone())).is_ok())
            .count()
    }

    /// Push a status to every open channel.
    pub fn broadcast_status(&self, status: &ChannelStatus) -> usize {
        let mut inner = self.inner.lock();
        inner.prune();

        inner
            .channels
            .iter()
            .filter(|c| c.tx.try_send(ChannelEvent::Status(status.clone())).is_ok())
            .count()
    }
}

#[async_trait]
impl ChangeStreamPort for InMemoryChangeStream {
    async fn subscribe(
        &self,
        request: ChannelRequest,
    ) -> Result<ChannelSubscription, ChangeStreamError> {
        let mut inner = self.inner.lock();
        inner.requests.push(request.clone());
        if let Some(error) = inner.failures.pop_front() {
            return Err(error);
        }

        let (tx, events) = mpsc::channel(CHANNEL_BUFFER);
        let cancel = CancellationToken::new();
        if !inner.manual_ack {
            let _ = tx.try_send(ChannelEvent::Status(ChannelStatus::Subscribed));
        }

        tracing::debug!(topic = %request.topic, "In-memory channel opened");
        inner.channels.push(OpenChannel {
            request,
            tx,
            cancel: cancel.clone(),
        });
        inner.prune();

        Ok(ChannelSubscription { events, cancel })
    }
}
