// src/broker/memory.rs

//! In-memory broker implementation.
//!
//! Simulates a message broker entirely within the process and defines the
//! reference delivery semantics for the [`Broker`] contract:
//!
//! - Once `declare_queue()` returns, publishes to that queue are buffered
//!   and deliverable, even before a consumer subscribes.
//! - Each queue has at most one consumer (sufficient for RPC usage, where
//!   the dispatcher is the single reader of the request queue and each
//!   client the single reader of its reply queue).
//! - Publishing to an undeclared queue is a `Publish` error. This is
//!   stricter than AMQP's silent default-exchange drop, deliberately so:
//!   it turns topology mistakes into visible test failures.
//! - `set_prefetch` is recorded but not enforced; the dispatcher's
//!   semaphore is the authoritative bound in-process.
//!
//! The broker keeps acknowledgment counters so tests can assert that every
//! delivery is resolved exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::macros::log_debug;
use crate::{
    //
    AckHandle,
    Address,
    Broker,
    Delivery,
    DeliveryStream,
    Envelope,
    Error,
    QueueHandle,
    QueueSpec,
    Result,
};

/// Per-queue message buffer capacity.
const QUEUE_DEPTH: usize = 64;

#[derive(Default)]
struct Counters {
    published: AtomicUsize,
    delivered: AtomicUsize,
    acked: AtomicUsize,
    rejected: AtomicUsize,
    requeued: AtomicUsize,
}

/// Snapshot of broker-side acknowledgment accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Envelopes accepted by `publish`.
    pub published: usize,
    /// Deliveries handed to consumers.
    pub delivered: usize,
    /// Deliveries positively acknowledged.
    pub acked: usize,
    /// Deliveries rejected without requeue.
    pub rejected: usize,
    /// Deliveries rejected with requeue.
    pub requeued: usize,
}

struct QueueState {
    tx: mpsc::Sender<Envelope>,
    // Taken by the first (and only) subscriber.
    rx: Option<mpsc::Receiver<Envelope>>,
}

/// In-memory broker. Create with [`MemoryBroker::create`].
pub struct MemoryBroker {
    queues: RwLock<HashMap<String, QueueState>>,
    counters: Arc<Counters>,
    forwarders: RwLock<Vec<JoinHandle<()>>>,
}

impl MemoryBroker {
    /// Create a new in-memory broker.
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            queues: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            forwarders: RwLock::new(Vec::new()),
        })
    }

    /// Snapshot the acknowledgment counters.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            published: self.counters.published.load(Ordering::SeqCst),
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            acked: self.counters.acked.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            requeued: self.counters.requeued.load(Ordering::SeqCst),
        }
    }
}

/// Manual-ack handle: resolves into the broker's counters, re-publishes on
/// requeue.
struct MemoryAck {
    counters: Arc<Counters>,
    requeue_tx: mpsc::Sender<Envelope>,
    envelope: Envelope,
}

#[async_trait::async_trait]
impl AckHandle for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        if requeue {
            self.counters.requeued.fetch_add(1, Ordering::SeqCst);
            // Queue gone means there is nowhere to requeue to; drop.
            let _ = self.requeue_tx.send(self.envelope).await;
        } else {
            self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Handle for auto-ack subscriptions: the broker considers the delivery
/// settled on arrival, so resolution is a no-op.
struct NoopAck;

#[async_trait::async_trait]
impl AckHandle for NoopAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn reject(self: Box<Self>, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, spec: QueueSpec) -> Result<QueueHandle> {
        let mut queues = self.queues.write().await;

        // Redeclaring an existing queue is idempotent.
        if !queues.contains_key(&spec.name) {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            queues.insert(spec.name.clone(), QueueState { tx, rx: Some(rx) });
        }

        Ok(QueueHandle {
            name: Address::from(spec.name),
        })
    }

    async fn publish(&self, destination: &Address, envelope: Envelope) -> Result<()> {
        let tx = {
            let queues = self.queues.read().await;
            queues
                .get(destination.as_str())
                .map(|q| q.tx.clone())
                .ok_or_else(|| {
                    Error::Publish(format!("no such queue: {}", destination.as_str()))
                })?
        };

        tx.send(envelope)
            .await
            .map_err(|_| Error::Publish(format!("queue closed: {}", destination.as_str())))?;

        self.counters.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, queue: &QueueHandle, auto_ack: bool) -> Result<DeliveryStream> {
        let (mut raw_rx, requeue_tx) = {
            let mut queues = self.queues.write().await;
            let state = queues.get_mut(queue.name.as_str()).ok_or_else(|| {
                Error::Broker(format!("subscribe to undeclared queue: {}", queue.name.as_str()))
            })?;
            let rx = state.rx.take().ok_or_else(|| {
                Error::Broker(format!("queue already consumed: {}", queue.name.as_str()))
            })?;
            (rx, state.tx.clone())
        };

        let (delivery_tx, delivery_rx) = mpsc::channel(QUEUE_DEPTH);
        let counters = Arc::clone(&self.counters);

        // Forwarder attaches the acknowledgment obligation to each envelope
        // as it crosses from the queue buffer to the consumer.
        let handle = tokio::spawn(async move {
            while let Some(envelope) = raw_rx.recv().await {
                counters.delivered.fetch_add(1, Ordering::SeqCst);

                let acker: Box<dyn AckHandle> = if auto_ack {
                    Box::new(NoopAck)
                } else {
                    Box::new(MemoryAck {
                        counters: Arc::clone(&counters),
                        requeue_tx: requeue_tx.clone(),
                        envelope: envelope.clone(),
                    })
                };

                if delivery_tx.send(Delivery::new(envelope, acker)).await.is_err() {
                    // Consumer dropped its stream.
                    break;
                }
            }
            log_debug!("memory broker: forwarder finished");
        });

        self.forwarders.write().await.push(handle);

        Ok(DeliveryStream { inbox: delivery_rx })
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        // Recorded for contract symmetry only; in-process flow control is
        // the dispatcher's semaphore.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.queues.write().await.clear();

        let mut forwarders = self.forwarders.write().await;
        for handle in forwarders.drain(..) {
            handle.abort();
        }
        Ok(())
    }
}
