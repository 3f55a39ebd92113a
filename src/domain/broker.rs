// src/domain/broker.rs

//! Broker collaborator abstractions.
//!
//! The broker is an external collaborator: it owns connections, queue
//! topology and delivery plumbing. The RPC core depends on the narrow
//! contract defined here and nothing else. Concrete implementations live
//! under `src/broker/` (in-memory reference implementation, AMQP via lapin).
//!
//! The in-memory broker defines the reference delivery semantics. Other
//! brokers are expected to approximate them as closely as their underlying
//! systems allow and to document unavoidable deviations.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{CorrelationId, Result};

/// A destination identifier.
///
/// Interpretation is broker-specific (queue name, routing key); the domain
/// layer treats it as opaque. Cheap to clone and safe to share.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Address(value.into())
    }
}

impl Address {
    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The unit exchanged in both directions.
///
/// The payload is opaque bytes; the protocol never interprets it. The
/// metadata fields map onto the broker's standard message properties
/// rather than being re-serialized into the body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination the envelope is (or was) published to.
    pub address: Address,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Token linking a response to its originating request.
    ///
    /// Present on every request the client coordinator issues, echoed
    /// verbatim on the matching response.
    pub correlation_id: Option<CorrelationId>,

    /// Private destination where the response must be published.
    /// Set on requests, absent on responses.
    pub reply_to: Option<Address>,

    /// Advisory content-type metadata, not interpreted by the core.
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    /// Create a request envelope.
    pub fn request(
        address: Address,
        payload: Bytes,
        correlation_id: CorrelationId,
        reply_to: Address,
        content_type: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(content_type.into()),
        }
    }

    /// Create a response envelope carrying the request's correlation id.
    pub fn response(
        address: Address,
        payload: Bytes,
        correlation_id: CorrelationId,
        content_type: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(content_type.into()),
        }
    }
}

/// Declaration parameters for a queue.
#[derive(Clone, Debug)]
pub struct QueueSpec {
    /// Queue name. Must be unique per broker instance.
    pub name: String,
    /// Survive broker restarts (broker permitting).
    pub durable: bool,
    /// Restricted to the declaring connection.
    pub exclusive: bool,
    /// Removed when the last consumer disconnects.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Shared work queue consumed by a dispatcher.
    pub fn work(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private, ephemeral reply queue owned by one client.
    ///
    /// Exclusive and auto-delete, so stale replies cannot leak to
    /// unrelated clients and the queue vanishes when the client goes away.
    pub fn reply(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Handle to a declared queue, used for subscribing and as a reply address.
#[derive(Clone, Debug)]
pub struct QueueHandle {
    /// Resolved queue name (may be broker-generated).
    pub name: Address,
}

/// Acknowledgment obligation attached to a delivery.
///
/// Implementations resolve the underlying broker-side state. Consuming
/// `self` makes double resolution unrepresentable.
#[async_trait::async_trait]
pub trait AckHandle: Send {
    /// Positively acknowledge the delivery.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Reject the delivery, optionally asking the broker to requeue it.
    async fn reject(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// One inbound message observed by a consumer.
///
/// Owns its acknowledgment handle; `ack` and `reject` consume the delivery,
/// so each delivery is resolved at most once by construction. Dropping a
/// delivery unresolved leaves the outcome to the broker (auto-ack
/// subscriptions carry a no-op handle and have no obligation).
pub struct Delivery {
    /// The received envelope.
    pub envelope: Envelope,
    acker: Box<dyn AckHandle>,
}

impl Delivery {
    /// Pair an envelope with its acknowledgment handle.
    pub fn new(envelope: Envelope, acker: Box<dyn AckHandle>) -> Self {
        Self { envelope, acker }
    }

    /// Acknowledge this delivery. Terminal.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject this delivery. Terminal; `requeue: false` abandons the work.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

/// Stream of deliveries for one subscription.
///
/// The subscription stays active until the handle is dropped or the broker
/// closes; the inbox then yields `None`.
pub struct DeliveryStream {
    /// Receiver for inbound deliveries.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// Broker collaborator contract.
///
/// Implementations must serialize concurrent publishes if the underlying
/// transport is not itself concurrency-safe (the AMQP implementation does
/// this with an actor task that owns the channel).
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue, returning a handle to the resolved name.
    async fn declare_queue(&self, spec: QueueSpec) -> Result<QueueHandle>;

    /// Publish an envelope to a destination.
    async fn publish(&self, destination: &Address, envelope: Envelope) -> Result<()>;

    /// Begin consuming a queue.
    ///
    /// With `auto_ack` the broker considers each delivery settled on
    /// arrival and the delivery carries no acknowledgment obligation.
    async fn subscribe(&self, queue: &QueueHandle, auto_ack: bool) -> Result<DeliveryStream>;

    /// Bound the number of unacknowledged deliveries the broker pushes at
    /// once. Couples the broker-side window to the dispatcher's permits.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Close the broker and release associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared broker pointer.
///
/// `Arc<dyn Broker>`: cheap to clone, one underlying connection shared by
/// every clone.
pub type BrokerPtr = Arc<dyn Broker>;
