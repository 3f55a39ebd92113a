// src/broker/amqp/lapin.rs

//! AMQP [`Broker`] implementation using `lapin`.
//!
//! ## Concurrency model
//!
//! A single background **actor task** owns the AMQP connection and channel.
//! All broker operations (publish, queue declaration, consumer setup, QoS,
//! shutdown) are serialized through a command channel to that actor; no
//! other task ever touches the connection directly. This satisfies the
//! domain requirement that concurrent publishes be serialized when the
//! underlying transport is not concurrency-safe.
//!
//! ## Wire mapping
//!
//! Envelope metadata maps to standard AMQP message properties:
//!
//! - `correlation_id` → `correlation-id`
//! - `reply_to`       → `reply-to`
//! - `content_type`   → `content-type`
//!
//! The payload is published as the raw message body. Messages are routed
//! through the default exchange with the destination queue name as the
//! routing key (classic RPC topology).
//!
//! ## Connection behavior
//!
//! The initial connection is retried per the config's [`ReconnectPolicy`]
//! before failing with `Error::Connect`. Mid-session reconnection is out
//! of scope here.

use std::collections::HashMap;
use std::sync::Arc;

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::macros::{log_debug, log_error, log_info, log_warn};
use crate::{
    //
    AckHandle,
    Address,
    Broker,
    BrokerPtr,
    CorrelationId,
    Delivery,
    DeliveryStream,
    Envelope,
    Error,
    QueueHandle,
    QueueSpec,
    Result,
    RpcConfig,
};

/// Delivery fan-in channel capacity per subscription.
const INBOX_DEPTH: usize = 64;

//
// Actor commands
//

enum Cmd {
    //
    DeclareQueue {
        spec: QueueSpec,
        resp: oneshot::Sender<Result<QueueHandle>>,
    },
    Publish {
        destination: Address,
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        queue: String,
        auto_ack: bool,
        resp: oneshot::Sender<Result<DeliveryStream>>,
    },
    SetPrefetch {
        count: u16,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// AMQP broker backed by a lapin connection.
///
/// Cheap to clone through [`BrokerPtr`]; every clone talks to the same
/// actor and connection.
pub struct AmqpBroker {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl AmqpBroker {
    fn create(broker_id: &str, connection: Connection, channel: Channel) -> BrokerPtr {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let actor = Actor {
            broker_id: broker_id.to_string(),
            connection,
            channel,
            cmd_rx,
            consumer_tasks: HashMap::new(),
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        Arc::new(Self { cmd_tx })
    }

    async fn send_cmd<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Cmd,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Broker("amqp actor command channel closed".into()))?;

        rx.await
            .map_err(|_| Error::Broker("amqp actor dropped command response".into()))?
    }
}

/// Background actor owning the AMQP connection and channel.
struct Actor {
    //
    broker_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumer_tasks: HashMap<String, JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.broker_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle_cmd(cmd).await {
                break;
            }
        }

        for (_, handle) in self.consumer_tasks.drain() {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_info!("[{}] AMQP actor stopped", self.broker_id);
    }

    /// Returns `true` when the actor should shut down.
    async fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        // ---
        match cmd {
            Cmd::DeclareQueue { spec, resp } => {
                let _ = resp.send(self.do_declare(spec).await);
            }
            Cmd::Publish {
                destination,
                env,
                resp,
            } => {
                let _ = resp.send(self.do_publish(&destination, env).await);
            }
            Cmd::Subscribe {
                queue,
                auto_ack,
                resp,
            } => {
                let _ = resp.send(self.do_subscribe(queue, auto_ack).await);
            }
            Cmd::SetPrefetch { count, resp } => {
                let result = self
                    .channel
                    .basic_qos(count, BasicQosOptions::default())
                    .await
                    .map_err(|e| Error::Broker(format!("amqp: basic_qos failed: {e}")));
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn do_declare(&mut self, spec: QueueSpec) -> Result<QueueHandle> {
        // ---
        let opts = QueueDeclareOptions {
            passive: false,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(&spec.name, opts, FieldTable::default())
            .await
            .map_err(|e| Error::Broker(format!("amqp: queue declare failed: {e}")))?;

        log_info!("[{}] Declared queue: {}", self.broker_id, queue.name());

        Ok(QueueHandle {
            name: Address::from(queue.name().as_str()),
        })
    }

    async fn do_publish(&mut self, destination: &Address, env: Envelope) -> Result<()> {
        // ---
        let mut properties = BasicProperties::default();
        if let Some(id) = &env.correlation_id {
            properties = properties.with_correlation_id(id.as_str().to_string().into());
        }
        if let Some(reply_to) = &env.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().to_string().into());
        }
        if let Some(content_type) = &env.content_type {
            properties = properties.with_content_type(content_type.to_string().into());
        }

        let _confirm = self
            .channel
            .basic_publish(
                "",                      // default exchange
                destination.as_str(),    // routing key = queue name
                BasicPublishOptions::default(),
                &env.payload,
                properties,
            )
            .await
            .map_err(|e| Error::Publish(format!("amqp: publish failed: {e}")))?;

        log_debug!("[{}] Published to queue: {destination:?}", self.broker_id);
        Ok(())
    }

    async fn do_subscribe(&mut self, queue: String, auto_ack: bool) -> Result<DeliveryStream> {
        // ---
        if self.consumer_tasks.contains_key(&queue) {
            return Err(Error::Broker(format!("amqp: already consuming queue: {queue}")));
        }

        let consume_opts = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                &queue,
                &consumer_tag(&self.broker_id, &queue),
                consume_opts,
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("amqp: consume failed: {e}")))?;

        log_info!("[{}] Started consuming queue: {queue}", self.broker_id);

        let (delivery_tx, delivery_rx) = mpsc::channel(INBOX_DEPTH);
        let broker_id = self.broker_id.clone();
        let queue_name = queue.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let envelope = envelope_from_delivery(&queue_name, &delivery);

                        let acker: Box<dyn AckHandle> = if auto_ack {
                            Box::new(SettledAck)
                        } else {
                            Box::new(AmqpAck {
                                acker: delivery.acker,
                            })
                        };

                        if delivery_tx
                            .send(Delivery::new(envelope, acker))
                            .await
                            .is_err()
                        {
                            log_debug!("[{broker_id}] Subscriber dropped for queue: {queue_name}");
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("[{broker_id}] Consumer error on {queue_name}: {e}");
                        break;
                    }
                }
            }

            log_info!("[{broker_id}] Consumer task ended for queue: {queue_name}");
        });

        self.consumer_tasks.insert(queue, handle);

        Ok(DeliveryStream { inbox: delivery_rx })
    }
}

/// Consumer tag for one subscription.
///
/// Tags must be unique per channel, and one process routinely consumes
/// several queues over the shared channel (a client's reply queue and a
/// dispatcher's request queue). The queue name disambiguates; the actor
/// already refuses a second subscription to the same queue.
fn consumer_tag(broker_id: &str, queue: &str) -> String {
    format!("{broker_id}-{queue}-consumer")
}

fn envelope_from_delivery(queue: &str, delivery: &lapin::message::Delivery) -> Envelope {
    // ---
    let properties = &delivery.properties;

    Envelope {
        address: Address::from(queue),
        payload: bytes::Bytes::copy_from_slice(&delivery.data),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| CorrelationId::from(s.as_str())),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|s| Address::from(s.as_str())),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|s| Arc::<str>::from(s.as_str())),
    }
}

/// Manual acknowledgment backed by the lapin acker.
struct AmqpAck {
    acker: lapin::acker::Acker,
}

#[async_trait::async_trait]
impl AckHandle for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| Error::Broker(format!("amqp: ack failed: {e}")))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| Error::Broker(format!("amqp: nack failed: {e}")))
    }
}

/// No-op handle for `no_ack` consumers; the broker settled on delivery.
struct SettledAck;

#[async_trait::async_trait]
impl AckHandle for SettledAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn reject(self: Box<Self>, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    // ---
    async fn declare_queue(&self, spec: QueueSpec) -> Result<QueueHandle> {
        self.send_cmd(|resp| Cmd::DeclareQueue { spec, resp }).await
    }

    async fn publish(&self, destination: &Address, envelope: Envelope) -> Result<()> {
        let destination = destination.clone();
        self.send_cmd(|resp| Cmd::Publish {
            destination,
            env: envelope,
            resp,
        })
        .await
    }

    async fn subscribe(&self, queue: &QueueHandle, auto_ack: bool) -> Result<DeliveryStream> {
        let queue = queue.name.as_str().to_string();
        self.send_cmd(|resp| Cmd::Subscribe {
            queue,
            auto_ack,
            resp,
        })
        .await
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.send_cmd(|resp| Cmd::SetPrefetch { count, resp }).await
    }

    async fn close(&self) -> Result<()> {
        // A closed command channel means the actor already shut down.
        let _ = self.send_cmd(|resp| Cmd::Close { resp }).await;
        Ok(())
    }
}

/// Create a lapin-backed AMQP broker from the configuration.
///
/// Connects eagerly, retrying per the config's reconnect policy.
///
/// # Errors
///
/// - `Error::Config` if no broker URI is configured
/// - `Error::Connect` once the reconnect policy is exhausted
pub async fn create_amqp_broker(config: &RpcConfig) -> Result<BrokerPtr> {
    // ---
    let uri = config
        .broker_uri
        .as_deref()
        .ok_or_else(|| Error::Config("AMQP broker requires a broker URI".into()))?;

    let connection = connect_with_retry(uri, config).await?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        Error::Connect(msg)
    })?;

    log_info!("[{}] Connected to AMQP broker", config.client_id);

    Ok(AmqpBroker::create(&config.client_id, connection, channel))
}

async fn connect_with_retry(uri: &str, config: &RpcConfig) -> Result<Connection> {
    // ---
    let policy = &config.reconnect;
    let mut attempt = 1u32;

    loop {
        log_info!(
            "[{}] Connecting to AMQP broker (attempt {attempt}/{})",
            config.client_id,
            policy.max_attempts
        );

        match Connection::connect(uri, ConnectionProperties::default()).await {
            Ok(connection) => return Ok(connection),
            Err(e) if attempt < policy.max_attempts => {
                log_warn!(
                    "[{}] Connection attempt {attempt} failed: {e}; retrying in {:?}",
                    config.client_id,
                    policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => {
                let msg = format!("amqp: connection failed after {attempt} attempts: {e}");
                log_error!("{msg}");
                return Err(Error::Connect(msg));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn consumer_tags_are_unique_per_queue() {
        // ---
        let reply = consumer_tag("node-1", "rpc.reply.node-1.abc");
        let work = consumer_tag("node-1", "rpc_queue");
        assert_ne!(reply, work);
    }
}
