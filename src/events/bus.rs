//! Ordered multi-subscriber event bus over `tokio::sync::broadcast`

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{Event, EventKind};
use crate::models::constants::DEFAULT_EVENT_CAPACITY;

type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct BusInner {
    sender: broadcast::Sender<Event>,
    /// Last assigned sequence number; held while sending so publish order equals seq order
    seq: Mutex<u64>,
}

/// Cloneable handle to the event channel.
///
/// Every subscriber sees events in publish order. Publishing never blocks and
/// never fails: events sent while nobody is subscribed are dropped.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("last_seq", &self.last_seq())
            .field("subscribers", &self.inner.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                seq: Mutex::new(0),
            }),
        }
    }

    /// Stamp and publish an event, returning the stamped envelope
    pub fn publish(&self, kind: EventKind) -> Event {
        let mut seq = self.inner.seq.lock();
        *seq += 1;
        let event = Event {
            seq: *seq,
            timestamp: Utc::now(),
            kind,
        };
        debug!(seq = event.seq, event = event.name(), node_id = ?event.node_id(), "publish");
        // No receivers is not an error
        let _ = self.inner.sender.send(event.clone());
        event
    }

    /// Sequence number of the most recently published event (0 before any)
    pub fn last_seq(&self) -> u64 {
        *self.inner.seq.lock()
    }

    /// Continue numbering after a restored snapshot
    pub fn advance_seq_to(&self, seq: u64) {
        let mut current = self.inner.seq.lock();
        if seq > *current {
            *current = seq;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.sender.subscribe(),
            filter: None,
        }
    }

    /// Receive only events matching `filter`, still in publish order
    pub fn subscribe_filtered<F>(&self, filter: F) -> Subscription
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Subscription {
            rx: self.inner.sender.subscribe(),
            filter: Some(Arc::new(filter)),
        }
    }
}

/// Ordered stream of events for one subscriber
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    filter: Option<Filter>,
}

impl Subscription {
    fn accepts(&self, event: &Event) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }

    /// Wait for the next matching event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already queued
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; events were dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
