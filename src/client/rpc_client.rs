// src/client/rpc_client.rs

//! RPC client coordinator.
//!
//! # Architecture
//!
//! On construction the client declares one **private, ephemeral reply
//! queue** (exclusive, auto-delete) and subscribes to it with auto-ack.
//! Exclusivity means stale replies can never leak to unrelated clients;
//! auto-delete removes the queue when the client disconnects.
//!
//! A background receive loop matches incoming responses to pending
//! requests by correlation id. Each `call` registers a oneshot slot in the
//! pending map, publishes a request envelope with `reply_to` set to the
//! private queue, and waits on the slot under a deadline. Responses whose
//! correlation id matches no pending entry are dropped silently; they are
//! stragglers for calls that already timed out, never an error.
//!
//! # Concurrency
//!
//! Multiple calls may be in flight on one client; the correlation id
//! demultiplexes them on the shared reply subscription. The pending map is
//! behind a mutex, but operations are just HashMap insert/remove so
//! contention is minimal.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use crate::client::PendingRequests;
use crate::macros::log_debug;
use crate::{
    //
    Address,
    BrokerPtr,
    CorrelationId,
    Envelope,
    Error,
    QueueSpec,
    Result,
    RpcConfig,
};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is a best-effort pending-response map with no
/// cross-field invariants; the worst outcome of a poisoned lock is one
/// dropped or unmatched response. This also avoids propagating non-`Send`
/// poison errors across async boundaries.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    broker: BrokerPtr,
    config: RpcConfig,
    request_queue: Address,
    reply_queue: Address,
    pending: Arc<Mutex<PendingRequests>>,

    /// Receive loop handle, kept so the task can be torn down on `close`.
    rx_task: JoinHandle<()>,
}

impl RpcClient {
    // ---
    /// Create a client over an established broker.
    ///
    /// Declares the private reply queue and starts the receive loop.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if the configuration fails validation
    /// - `Error::Broker` if the reply queue cannot be declared or consumed
    pub async fn connect(broker: BrokerPtr, config: RpcConfig) -> Result<Self> {
        // ---
        config.validate()?;

        // Unique per client *instance*: two clients sharing a client_id
        // still get disjoint reply queues.
        let reply_name = format!(
            "rpc.reply.{}.{}",
            config.client_id,
            Uuid::new_v4().simple()
        );

        let reply_handle = broker.declare_queue(QueueSpec::reply(reply_name)).await?;
        let mut stream = broker.subscribe(&reply_handle, true).await?;

        let pending = Arc::new(Mutex::new(PendingRequests::new()));

        // The loop holds only a weak reference so it winds down once the
        // client is gone, instead of pinning the pending map forever.
        let weak: Weak<Mutex<PendingRequests>> = Arc::downgrade(&pending);

        let rx_task = tokio::spawn(async move {
            // ---
            while let Some(delivery) = stream.inbox.recv().await {
                let Some(pending) = weak.upgrade() else {
                    break;
                };

                match delivery.envelope.correlation_id.clone() {
                    Some(correlation_id) => {
                        let matched = lock_ignore_poison(&pending)
                            .complete(&correlation_id, delivery.envelope.payload.clone());
                        if !matched {
                            log_debug!(
                                "response arrived after request abandoned \
                                 (correlation_id: {correlation_id})"
                            );
                        }
                    }
                    None => {
                        log_debug!("response without correlation id dropped");
                    }
                }
            }
            log_debug!("reply subscription closed");
        });

        Ok(Self {
            inner: Arc::new(Inner {
                request_queue: Address::from(config.request_queue.as_str()),
                reply_queue: reply_handle.name,
                broker,
                config,
                pending,
                rx_task,
            }),
        })
    }

    /// Issue a request and wait for the correlated response, using the
    /// configured default timeout.
    pub async fn call(&self, body: Bytes) -> Result<Bytes> {
        // ---
        self.call_with_timeout(body, self.inner.config.request_timeout)
            .await
    }

    /// Issue a request and wait up to `timeout` for the correlated response.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if `timeout` is zero
    /// - `Error::Publish` if the request cannot be published
    /// - `Error::Timeout` if no matching response arrives in time; the
    ///   pending wait is abandoned and a late reply is dropped on arrival
    pub async fn call_with_timeout(&self, body: Bytes, timeout: Duration) -> Result<Bytes> {
        // ---
        if timeout.is_zero() {
            return Err(Error::Config("call timeout must be positive".into()));
        }

        let correlation_id = CorrelationId::generate();

        let rx = lock_ignore_poison(&self.inner.pending).register(correlation_id.clone());

        let env = Envelope::request(
            self.inner.request_queue.clone(),
            body,
            correlation_id.clone(),
            self.inner.reply_queue.clone(),
            "application/octet-stream",
        );

        if let Err(e) = self.inner.broker.publish(&self.inner.request_queue, env).await {
            lock_ignore_poison(&self.inner.pending).abandon(&correlation_id);
            return Err(match e {
                Error::Publish(msg) => Error::Publish(msg),
                other => Error::Publish(other.to_string()),
            });
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_recv_err)) => {
                // Sender dropped without completing: the receive loop (and
                // with it the pending map) went away underneath us.
                Err(Error::Broker("reply subscription closed".into()))
            }
            Err(_elapsed) => {
                lock_ignore_poison(&self.inner.pending).abandon(&correlation_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Typed convenience wrapper: JSON-encode the request, JSON-decode the
    /// response.
    pub async fn call_typed<TReq, TResp>(&self, req: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let body = Bytes::from(serde_json::to_vec(req)?);
        let response = self.call(body).await?;
        Ok(serde_json::from_slice(&response)?)
    }

    /// Number of requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }

    /// Stop the receive loop. In-flight calls observe a closed reply
    /// subscription.
    pub fn close(&self) {
        self.inner.rx_task.abort();
    }
}
