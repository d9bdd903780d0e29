//! Shared queue connecting scrapers to the ingestion pipeline.
//!
//! Many producer tasks call [`MessageSink::put`] concurrently; a single
//! consumer drains the other end via [`MessageStream::get`]. Per-producer
//! order is preserved, cross-producer interleaving is unspecified.
//! [`MessageStream::shutdown`] rejects further puts while still letting the
//! consumer drain everything already accepted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::ScrapedMessage;

/// Returned by [`MessageSink::put`] after the consumer side shut down.
#[derive(Debug, Error)]
#[error("sink is closed")]
pub struct SinkClosed;

/// Producer handle. Cheap to clone; one clone per scraper.
#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::UnboundedSender<ScrapedMessage>,
    depth: Arc<AtomicUsize>,
}

/// Consumer end owned by the ingestion pipeline.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<ScrapedMessage>,
    depth: Arc<AtomicUsize>,
}

/// Create a connected sink/stream pair.
pub fn channel() -> (MessageSink, MessageStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        MessageSink {
            tx,
            depth: Arc::clone(&depth),
        },
        MessageStream { rx, depth },
    )
}

impl MessageSink {
    /// Enqueue a message without blocking the producer.
    ///
    /// An accepted message is never lost: it stays queued until the consumer
    /// drains it, even after shutdown.
    pub fn put(&self, message: ScrapedMessage) -> Result<(), SinkClosed> {
        self.tx.send(message).map_err(|_| SinkClosed)?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of messages accepted but not yet consumed.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl MessageStream {
    /// Pop the next message, waiting if the queue is empty.
    ///
    /// Returns `None` once the sink is shut down (or every producer handle
    /// is dropped) and the queue is fully drained.
    pub async fn get(&mut self) -> Option<ScrapedMessage> {
        let message = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(message)
    }

    /// Signal that no further puts are accepted. Queued messages remain
    /// available to [`get`](Self::get) until drained.
    pub fn shutdown(&mut self) {
        self.rx.close();
    }
}
