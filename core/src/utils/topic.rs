/// Hot publish/subscribe fan-out
///
/// Every subscriber gets its own unbounded queue. Values published before a
/// subscriber existed are never replayed. Dropping a `Subscription`
/// unsubscribes it; the publisher prunes dead queues on the next publish.
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub struct Topic<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Topic<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// Deliver to every live subscriber, returns how many received it
    pub fn publish(&self, value: T) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|mut subscribers| {
                subscribers.retain(|tx| !tx.is_closed());
                subscribers.len()
            })
            .unwrap_or(0)
    }

    /// Drop all subscriber queues; their streams end once drained
    pub fn close(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }
}

impl<T: Clone> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a `Topic`
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Next value, `None` once the topic closed this subscription
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next value if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Everything queued right now
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(value) = self.rx.try_recv() {
            out.push(value);
        }
        out
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
