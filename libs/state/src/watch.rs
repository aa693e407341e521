//! Watch fan-out with bounded subscriber queues.
//!
//! Each subscriber gets a bounded queue. A slow subscriber overflows its
//! queue; the store then places a `Resync` sentinel in a reserved final slot
//! and drops the sender, so the subscriber always learns it must re-list and
//! re-subscribe. The bus never blocks on a subscriber.

use tokio::sync::mpsc;
use tracing::warn;

use crate::resource::{Resource, ResourceSpec};

/// Live-event queue depth per subscriber.
pub const WATCH_QUEUE_DEPTH: usize = 64;

/// An event observed on a watched collection.
///
/// `Updated` carries both images so consumers can diff.
#[derive(Debug, Clone)]
pub enum Event<S> {
    Created(Resource<S>),
    Updated { old: Resource<S>, new: Resource<S> },
    Destroyed(Resource<S>),
    /// Initial listing is complete; subsequent events are live.
    Bootstrapped,
    /// This subscriber overflowed; re-list and re-subscribe.
    Resync,
}

/// Consumer half of a watch subscription.
pub struct WatchStream<S> {
    rx: mpsc::Receiver<Event<S>>,
}

impl<S: ResourceSpec> WatchStream<S> {
    /// Next event; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Event<S>> {
        self.rx.recv().await
    }
}

/// Producer half held by the store.
pub(crate) struct Sink<S> {
    tx: Option<mpsc::Sender<Event<S>>>,
    collection: String,
}

impl<S: ResourceSpec> Sink<S> {
    /// Create a subscription whose queue holds `bootstrap` initial events
    /// plus [`WATCH_QUEUE_DEPTH`] live events and the reserved resync slot.
    pub(crate) fn new(collection: String, bootstrap: usize) -> (Self, WatchStream<S>) {
        let (tx, rx) = mpsc::channel(bootstrap + WATCH_QUEUE_DEPTH + 1);

        (
            Self {
                tx: Some(tx),
                collection,
            },
            WatchStream { rx },
        )
    }

    /// Deliver an event.
    ///
    /// Returns `false` once the subscriber is gone or has overflowed and
    /// should be dropped from the fan-out list.
    pub(crate) fn publish(&mut self, event: Event<S>) -> bool {
        let Some(tx) = self.tx.clone() else {
            return false;
        };

        // The last slot is reserved for the resync sentinel.
        if tx.capacity() <= 1 {
            warn!(
                collection = %self.collection,
                "watch subscriber overflowed, forcing resync"
            );

            let _ = tx.try_send(Event::Resync);
            self.tx = None;

            return false;
        }

        match tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.tx = None;
                false
            }
        }
    }
}
