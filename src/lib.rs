//! Correlated request/response RPC over a shared, unordered message queue.
//!
//! A client publishes a request envelope into a well-known request queue
//! and waits for the matching reply on a private reply queue; a server
//! pool consumes the request queue under a bounded-concurrency policy,
//! executes a handler per delivery, and publishes the correlated reply.
//!
//! The library handles correlation-id generation and matching, timeout
//! handling, and permit-bounded concurrent dispatch. Queue topology and
//! delivery plumbing live behind the [`Broker`] collaborator trait; an
//! in-memory reference broker is always available and an AMQP broker
//! (lapin) is provided behind the `broker-amqp` feature.

// Import all sub modules once...
mod broker;
mod client;
mod domain;
mod server;

mod config;

mod correlation;
mod error;
mod macros;

// Re-export main types
pub use client::RpcClient;
pub use server::{typed_handler, Dispatcher, Handler, HandlerFuture};

pub use config::{Mode, ReconnectPolicy, RpcConfig};

pub use correlation::CorrelationId;
pub use error::{Error, Result};

pub use broker::{create_broker, MemoryBroker, MemoryStats};

#[cfg(feature = "broker-amqp")]
pub use broker::create_amqp_broker;

// --- public re-exports
pub use domain::{
    //
    AckHandle,
    Address,
    Broker,
    BrokerPtr,
    Delivery,
    DeliveryStream,
    Envelope,
    QueueHandle,
    QueueSpec,
};
