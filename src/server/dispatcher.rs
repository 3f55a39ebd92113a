// src/server/dispatcher.rs

//! The bounded dispatcher.
//!
//! A single reader consumes the request queue and fans work out to worker
//! tasks. Concurrency is capped by a counting semaphore sized at `permits`;
//! the same number is pushed to the broker as the prefetch window so the
//! broker-side bound and the local bound agree and nothing buffers
//! unbounded in front of the semaphore.
//!
//! Per delivery, the state machine is
//! `Received → Permitted → Executing → {Acked | Rejected}`; both terminal
//! states are reached exactly once on every path, including handler panics
//! and timeouts. The dispatcher never requeues: redelivery, if desired, is
//! the broker's policy.
//!
//! ## Permit lifetime
//!
//! The permit is held by the worker task for its entire lifetime, and a
//! handler that overruns its deadline is *aborted and awaited*, not left
//! running in the background. The permit is therefore never released
//! while handler code can still execute, so the number of concurrently
//! executing handlers can never exceed `permits`.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;

use crate::macros::{log_debug, log_error, log_info, log_warn};
use crate::server::Handler;
use crate::{
    //
    BrokerPtr,
    Delivery,
    Envelope,
    Error,
    QueueSpec,
    Result,
    RpcConfig,
};

/// Bounded request-queue dispatcher.
///
/// Cheap to clone; clones share the broker connection and configuration.
#[derive(Clone)]
pub struct Dispatcher {
    // ---
    broker: BrokerPtr,
    config: RpcConfig,
}

impl Dispatcher {
    // ---
    /// Create a dispatcher over an established broker.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration fails validation.
    pub fn new(broker: BrokerPtr, config: RpcConfig) -> Result<Self> {
        // ---
        config.validate()?;
        Ok(Self { broker, config })
    }

    /// Consume the request queue until the broker closes the stream.
    ///
    /// Declares the request queue, couples the broker prefetch window to
    /// the permit count, then dispatches deliveries to worker tasks. When
    /// the stream ends, outstanding workers are drained before returning,
    /// so no work leaks past shutdown.
    pub async fn run<H: Handler>(&self, handler: H) -> Result<()> {
        // ---
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let queue = self
            .broker
            .declare_queue(QueueSpec::work(
                self.config.request_queue.as_str(),
                self.config.durable_queues,
            ))
            .await?;

        self.broker.set_prefetch(self.config.permits).await?;

        let mut stream = self.broker.subscribe(&queue, false).await?;

        let permits = self.config.permits as usize;
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut workers = JoinSet::new();

        log_info!(
            "[{}] dispatcher started on '{}' (permits: {}, process timeout: {:?})",
            self.config.client_id,
            self.config.request_queue,
            self.config.permits,
            self.config.process_timeout
        );

        while let Some(delivery) = stream.inbox.recv().await {
            // Backpressure point: block the dispatch loop until a permit
            // frees up.
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| Error::Broker("dispatcher semaphore closed".into()))?;

            // Reap workers that already finished.
            while workers.try_join_next().is_some() {}

            let broker = self.broker.clone();
            let handler = Arc::clone(&handler);
            let process_timeout = self.config.process_timeout;

            workers.spawn(async move {
                // Held until the worker ends; by then the handler has
                // completed, failed, or been aborted.
                let _permit = permit;
                process_delivery(broker, handler, delivery, process_timeout).await;
            });
        }

        // Stream closed: wait for in-flight work instead of leaking it.
        while workers.join_next().await.is_some() {}

        log_info!("[{}] dispatcher stopped", self.config.client_id);
        Ok(())
    }

    /// Run the dispatch loop on a spawned task.
    pub fn spawn<H: Handler>(&self, handler: H) -> JoinHandle<Result<()>> {
        // ---
        let this = self.clone();
        tokio::spawn(async move { this.run(handler).await })
    }
}

/// Execute one delivery to a terminal ack/reject state.
async fn process_delivery(
    broker: BrokerPtr,
    handler: Arc<dyn Handler>,
    delivery: Delivery,
    process_timeout: std::time::Duration,
) {
    // ---
    let body = delivery.envelope.payload.clone();

    // The handler runs in its own task so a panic is contained and an
    // overrun can be aborted outright.
    let mut join = tokio::spawn(async move { handler.handle(body).await });

    match time::timeout(process_timeout, &mut join).await {
        // Completed in time.
        Ok(Ok(Ok(response))) => {
            reply_and_ack(broker, delivery, response).await;
        }
        // Handler returned an error.
        Ok(Ok(Err(e))) => {
            log_warn!("handler failed, rejecting without requeue: {e}");
            reject(delivery).await;
        }
        // Handler panicked (or was cancelled externally).
        Ok(Err(join_err)) => {
            log_error!("handler task faulted, rejecting without requeue: {join_err}");
            reject(delivery).await;
        }
        // Deadline elapsed: abandon the work. No response is published;
        // the client's own timeout is the compensating control.
        Err(_elapsed) => {
            join.abort();
            // Abort only takes effect at the handler's next yield point; a
            // CPU-bound body keeps executing until then. Wait for the task
            // to actually terminate so the permit held by our caller never
            // frees while handler code can still run.
            let _ = join.await;
            log_warn!(
                "handler exceeded process timeout ({process_timeout:?}), \
                 rejecting without requeue"
            );
            reject(delivery).await;
        }
    }
}

/// Publish the correlated response, then acknowledge.
///
/// A request without `reply_to` and a correlation id is fire-and-forget:
/// the work already ran, so it is acked without a reply.
async fn reply_and_ack(broker: BrokerPtr, delivery: Delivery, response: bytes::Bytes) {
    // ---
    let envelope = &delivery.envelope;

    let reply = match (&envelope.reply_to, &envelope.correlation_id) {
        (Some(reply_to), Some(correlation_id)) => Some(Envelope::response(
            reply_to.clone(),
            response,
            correlation_id.clone(),
            envelope
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into()),
        )),
        _ => {
            log_debug!("request without reply_to/correlation_id, acking without reply");
            None
        }
    };

    if let Some(reply) = reply {
        let destination = reply.address.clone();
        if let Err(e) = broker.publish(&destination, reply).await {
            // The caller can no longer get an answer; their timeout will
            // fire. Rejecting keeps the resolution exactly-once.
            log_error!("reply publish failed, rejecting delivery: {e}");
            reject(delivery).await;
            return;
        }
    }

    if let Err(e) = delivery.ack().await {
        log_error!("ack failed: {e}");
    }
}

async fn reject(delivery: Delivery) {
    // ---
    if let Err(e) = delivery.reject(false).await {
        log_error!("reject failed: {e}");
    }
}
