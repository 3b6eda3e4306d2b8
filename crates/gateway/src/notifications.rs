//! Per-subscriber notification queues.
//!
//! Publishing never blocks and never drops. A queue is created by whichever
//! comes first, a publish or a stream attachment, and is discarded only when
//! it is empty and no stream is attached to it.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use shared::{domain::SubscriberId, protocol::NotificationPayload};
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Default)]
struct SubscriberQueue {
    items: Mutex<VecDeque<NotificationPayload>>,
    ready: Notify,
    /// Only changed while the hub's map lock is held.
    consumers: AtomicUsize,
}

#[derive(Default)]
pub struct NotificationHub {
    queues: Mutex<HashMap<SubscriberId, Arc<SubscriberQueue>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, subscriber_id: &SubscriberId, payload: NotificationPayload) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(subscriber_id.clone()).or_default();
        let depth = {
            let mut items = queue.items.lock();
            items.push_back(payload);
            items.len()
        };
        queue.ready.notify_one();
        debug!(%subscriber_id, depth, "queued notification");
    }

    /// Streams the subscriber's notifications in publish order, waiting for
    /// new ones once the queue is drained.
    ///
    /// Dropping the stream detaches from the queue. Items still queued at
    /// that point stay for the next `stream` call on the same id. Only one
    /// stream per subscriber should be active; concurrent streams race on the
    /// same queue.
    pub fn stream(
        self: &Arc<Self>,
        subscriber_id: &SubscriberId,
    ) -> BoxStream<'static, NotificationPayload> {
        let queue = {
            let mut queues = self.queues.lock();
            let queue = Arc::clone(queues.entry(subscriber_id.clone()).or_default());
            queue.consumers.fetch_add(1, Ordering::SeqCst);
            queue
        };
        info!(%subscriber_id, "notification stream attached");

        let attachment = Attachment {
            hub: Arc::clone(self),
            subscriber_id: subscriber_id.clone(),
            queue,
        };
        stream::unfold(attachment, |attachment| async move {
            let payload = attachment.next().await;
            Some((payload, attachment))
        })
        .boxed()
    }

    pub fn queued(&self, subscriber_id: &SubscriberId) -> usize {
        self.queues
            .lock()
            .get(subscriber_id)
            .map(|queue| queue.items.lock().len())
            .unwrap_or(0)
    }

    pub fn has_queue(&self, subscriber_id: &SubscriberId) -> bool {
        self.queues.lock().contains_key(subscriber_id)
    }
}

struct Attachment {
    hub: Arc<NotificationHub>,
    subscriber_id: SubscriberId,
    queue: Arc<SubscriberQueue>,
}

impl Attachment {
    async fn next(&self) -> NotificationPayload {
        loop {
            let head = self.queue.items.lock().pop_front();
            if let Some(payload) = head {
                debug!(subscriber_id = %self.subscriber_id, "delivering notification");
                return payload;
            }
            self.queue.ready.notified().await;
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let mut queues = self.hub.queues.lock();
        let remaining = self.queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        let drained = self.queue.items.lock().is_empty();
        let is_current = queues
            .get(&self.subscriber_id)
            .is_some_and(|queue| Arc::ptr_eq(queue, &self.queue));
        if remaining == 0 && drained && is_current {
            queues.remove(&self.subscriber_id);
        }
        info!(
            subscriber_id = %self.subscriber_id,
            kept = !drained,
            "notification stream closed"
        );
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
