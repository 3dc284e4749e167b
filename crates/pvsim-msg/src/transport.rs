//! ---
//! pvsim_section: "02-messaging"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Frame codec and broker transports."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::{Result, TransportError};

/// One frame handed to a consumer, pending ack or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag used to ack or reject.
    pub tag: u64,
    /// Raw frame bytes.
    pub payload: Vec<u8>,
    /// Set when the frame was handed out before and requeued.
    pub redelivered: bool,
}

/// Durable point-to-point queue with manual acknowledgement.
///
/// Every operation other than `connect` fails with
/// [`TransportError::NotConnected`] when no live channel exists.
#[async_trait]
pub trait Transport: Send {
    /// Open (or reopen) the connection and declare the queue.
    async fn connect(&mut self) -> Result<()>;
    /// Whether a live channel is available.
    fn is_connected(&self) -> bool;
    /// Publish one persistent frame and wait for the broker confirm.
    async fn publish(&mut self, payload: &[u8]) -> Result<()>;
    /// Next unacknowledged delivery. `Ok(None)` means nothing is ready yet.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;
    /// Acknowledge a delivery.
    async fn ack(&mut self, tag: u64) -> Result<()>;
    /// Reject a delivery, optionally requeueing it.
    async fn reject(&mut self, tag: u64, requeue: bool) -> Result<()>;
    /// Close the channel and connection.
    async fn close(&mut self) -> Result<()>;
    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
}

#[derive(Debug)]
struct Queued {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    ready: VecDeque<Queued>,
    unacked: HashMap<u64, Vec<u8>>,
    next_tag: u64,
    prefetch: usize,
    failing_publishes: usize,
    published: u64,
    acked: u64,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            next_tag: 1,
            prefetch: 1,
            failing_publishes: 0,
            published: 0,
            acked: 0,
        }
    }
}

/// In-process queue behaving like a durable broker queue with prefetch 1.
///
/// Clones share the same queue, so one handle can be given to an emitter and
/// another to an aggregator. The connection flag is per handle.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<QueueState>>,
    connected: bool,
}

impl InMemoryTransport {
    /// Create a disconnected handle on a fresh queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes with a connection error, dropping the
    /// publishing handle's connection each time.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().failing_publishes = count;
    }

    /// Drop this handle's connection.
    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    /// Frames waiting to be delivered.
    pub fn pending(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Frames delivered but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Frames accepted by the queue since creation.
    pub fn published(&self) -> u64 {
        self.state.lock().published
    }

    /// Frames acknowledged since creation.
    pub fn acked(&self) -> u64 {
        self.state.lock().acked
    }

    /// Copy of the ready frames as text, head first.
    pub fn snapshot(&self) -> Vec<String> {
        self.state
            .lock()
            .ready
            .iter()
            .map(|item| String::from_utf8_lossy(&item.payload).into_owned())
            .collect()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn publish(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            self.connected = false;
            return Err(TransportError::Connection("injected publish failure".into()));
        }
        state.ready.push_back(Queued {
            payload: payload.to_vec(),
            redelivered: false,
        });
        state.published += 1;
        trace!(queued = state.ready.len(), "frame queued");
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if state.unacked.len() >= state.prefetch {
            return Ok(None);
        }
        let Some(item) = state.ready.pop_front() else {
            return Ok(None);
        };
        let tag = state.next_tag;
        state.next_tag += 1;
        state.unacked.insert(tag, item.payload.clone());
        Ok(Some(Delivery {
            tag,
            payload: item.payload,
            redelivered: item.redelivered,
        }))
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        state
            .unacked
            .remove(&tag)
            .ok_or(TransportError::UnknownDelivery(tag))?;
        state.acked += 1;
        Ok(())
    }

    async fn reject(&mut self, tag: u64, requeue: bool) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let payload = state
            .unacked
            .remove(&tag)
            .ok_or(TransportError::UnknownDelivery(tag))?;
        if requeue {
            state.ready.push_front(Queued {
                payload,
                redelivered: true,
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> InMemoryTransport {
        let mut transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        transport
    }

    #[tokio::test]
    async fn clones_share_the_queue() {
        let mut producer = connected().await;
        let mut consumer = producer.clone();
        producer.publish(b"START::1").await.unwrap();

        let delivery = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"START::1");
        assert!(!delivery.redelivered);
        consumer.ack(delivery.tag).await.unwrap();
        assert_eq!(producer.acked(), 1);
        assert_eq!(producer.pending(), 0);
    }

    #[tokio::test]
    async fn prefetch_holds_back_until_ack() {
        let mut transport = connected().await;
        transport.publish(b"a").await.unwrap();
        transport.publish(b"b").await.unwrap();

        let first = transport.next_delivery().await.unwrap().unwrap();
        assert!(transport.next_delivery().await.unwrap().is_none());
        transport.ack(first.tag).await.unwrap();
        let second = transport.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.payload, b"b");
    }

    #[tokio::test]
    async fn requeued_frames_return_to_the_head() {
        let mut transport = connected().await;
        transport.publish(b"a").await.unwrap();
        transport.publish(b"b").await.unwrap();

        let first = transport.next_delivery().await.unwrap().unwrap();
        transport.reject(first.tag, true).await.unwrap();
        assert_eq!(transport.snapshot(), vec!["a".to_owned(), "b".to_owned()]);

        let again = transport.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert!(again.redelivered);
        assert_ne!(again.tag, first.tag);

        transport.reject(again.tag, false).await.unwrap();
        assert_eq!(transport.pending(), 1);
        assert_eq!(transport.unacked(), 0);
    }

    #[tokio::test]
    async fn unknown_tags_are_errors() {
        let mut transport = connected().await;
        assert!(matches!(
            transport.ack(99).await,
            Err(TransportError::UnknownDelivery(99))
        ));
    }

    #[tokio::test]
    async fn operations_require_a_connection() {
        let mut transport = InMemoryTransport::new();
        assert!(matches!(
            transport.publish(b"x").await,
            Err(TransportError::NotConnected)
        ));
        transport.connect().await.unwrap();
        transport.disconnect();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.next_delivery().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn injected_failures_drop_the_connection() {
        let mut transport = connected().await;
        transport.fail_next_publishes(1);
        assert!(matches!(
            transport.publish(b"x").await,
            Err(TransportError::Connection(_))
        ));
        assert!(!transport.is_connected());
        transport.connect().await.unwrap();
        transport.publish(b"x").await.unwrap();
        assert_eq!(transport.published(), 1);
    }
}
