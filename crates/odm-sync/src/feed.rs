//! Replay-latest broadcast distribution of session values.

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// Multi-subscriber feed that replays the most recent value to each new
/// subscriber immediately upon subscription.
///
/// Built as a single-slot latest cache in front of a broadcast channel. The
/// feed never completes on its own; only [`ValueFeed::close`] terminates it.
pub struct ValueFeed<T> {
    latest: RwLock<Option<T>>,
    tx: RwLock<Option<broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> ValueFeed<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            latest: RwLock::new(None),
            tx: RwLock::new(Some(tx)),
        }
    }

    /// Publish a value to all current subscribers and cache it for future
    /// ones. Ignored after close.
    pub fn publish(&self, value: T) {
        let tx = self.tx.read();
        let Some(tx) = tx.as_ref() else {
            return;
        };
        *self.latest.write() = Some(value.clone());
        // A send with no live subscribers is fine; the cache still holds the
        // value for whoever subscribes next.
        let _ = tx.send(value);
    }

    /// Latest published value, if any.
    pub fn latest(&self) -> Option<T> {
        self.latest.read().clone()
    }

    /// Subscribe to the feed. The stream yields the cached latest first (if
    /// any), then every future emission.
    pub fn subscribe(&self) -> ValueStream<T> {
        let rx = self.tx.read().as_ref().map(|tx| tx.subscribe());
        ValueStream {
            replay: self.latest.read().clone(),
            rx,
        }
    }

    /// Close the feed. Streams yield any replay still owed, then terminate.
    pub fn close(&self) {
        self.tx.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }
}

/// A subscription handed out by [`ValueFeed::subscribe`].
pub struct ValueStream<T> {
    replay: Option<T>,
    rx: Option<broadcast::Receiver<T>>,
}

impl<T: Clone> ValueStream<T> {
    /// Next value, or `None` once the feed has been closed.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(value) = self.replay.take() {
            return Some(value);
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "feed subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_latest_to_new_subscribers() {
        let feed = ValueFeed::new(8);
        feed.publish(1u32);
        feed.publish(2u32);

        let mut stream = feed.subscribe();
        assert_eq!(stream.recv().await, Some(2));
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let feed = ValueFeed::new(8);
        feed.publish(1u32);

        let mut a = feed.subscribe();
        let mut b = feed.subscribe();
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(1));

        feed.publish(2u32);
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn close_terminates_after_replay() {
        let feed = ValueFeed::new(8);
        feed.publish(7u32);

        let mut stream = feed.subscribe();
        feed.close();

        // Replay is still owed, then the stream ends.
        assert_eq!(stream.recv().await, Some(7));
        assert_eq!(stream.recv().await, None);
        assert!(feed.is_closed());
    }

    #[tokio::test]
    async fn publish_after_close_is_ignored() {
        let feed = ValueFeed::new(8);
        feed.close();
        feed.publish(1u32);

        let mut stream = feed.subscribe();
        assert_eq!(stream.recv().await, None);
        assert_eq!(feed.latest(), None);
    }
}
