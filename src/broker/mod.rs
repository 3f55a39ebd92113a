// src/broker/mod.rs

//! Concrete broker implementations.
//!
//! - [`memory`]: in-process reference implementation, always available.
//! - `amqp`: lapin-backed AMQP broker, behind the `broker-amqp` feature.

pub mod memory;

#[cfg(feature = "broker-amqp")]
pub mod amqp;

pub use memory::{MemoryBroker, MemoryStats};

#[cfg(feature = "broker-amqp")]
pub use amqp::create_amqp_broker;

use crate::{BrokerPtr, Result, RpcConfig};

/// Create a broker from the configuration.
///
/// A configured `broker_uri` selects the AMQP broker (requires the
/// `broker-amqp` feature); no URI selects the in-memory broker.
pub async fn create_broker(config: &RpcConfig) -> Result<BrokerPtr> {
    config.validate()?;

    match &config.broker_uri {
        #[cfg(feature = "broker-amqp")]
        Some(_) => create_amqp_broker(config).await,

        #[cfg(not(feature = "broker-amqp"))]
        Some(_) => Err(crate::Error::Config(
            "broker URI configured but the broker-amqp feature is disabled".into(),
        )),

        None => {
            let broker: BrokerPtr = MemoryBroker::create();
            Ok(broker)
        }
    }
}
