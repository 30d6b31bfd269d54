//! Event fan-out to observers.
//!
//! Built on [`tokio::sync::broadcast`]: publishing never waits on a
//! subscriber, and every subscriber sees a bounded backlog. A subscriber that
//! falls behind loses the oldest buffered events and is told how many it
//! missed through [`Delivery::Gap`] before delivery resumes.
//!
//! The backlog is one ring shared by all subscribers, and filtering happens
//! on receipt. A [`SubscriptionFilter::Session`] subscriber therefore lags
//! on the total event rate: its gap counts every dropped event, including
//! ones for other sessions, and may be reported when none of its own were
//! lost.

use futures_util::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::models::event::{Event, EventPayload};

/// Which events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// Every session.
    All,
    /// A single session.
    Session(String),
}

impl SubscriptionFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Session(id) => event.session_id == *id,
        }
    }
}

/// One item of a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A published event.
    Event(Event),
    /// The subscriber fell behind and `missed` events were dropped.
    Gap {
        /// Number of events discarded from the shared backlog, before
        /// filtering.
        missed: u64,
    },
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Event>,
}

impl Broadcaster {
    /// Create a broadcaster with a per-subscriber backlog of `backlog`
    /// events.
    #[must_use]
    pub fn new(backlog: usize) -> Self {
        let (tx, _rx) = broadcast::channel(backlog.max(1));
        Self { tx }
    }

    /// Publish `payload` for `session_id`. Never blocks.
    pub fn publish(&self, session_id: &str, payload: EventPayload) {
        let event = Event::new(session_id, payload);
        match self.tx.send(event) {
            Ok(receivers) => trace!(session_id, receivers, "event published"),
            // No subscribers is not an error.
            Err(_) => trace!(session_id, "event published with no subscribers"),
        }
    }

    /// Register a new subscriber.
    #[must_use]
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        debug!(?filter, "subscriber registered");
        Subscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving half of a subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    filter: SubscriptionFilter,
}

impl Subscription {
    /// Wait for the next matching delivery. Returns `None` once the
    /// broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(Delivery::Event(event)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "subscriber lagged, reporting gap");
                    return Some(Delivery::Gap { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a [`Stream`] of deliveries.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send + Unpin {
        Box::pin(stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|delivery| (delivery, sub))
        }))
    }
}
