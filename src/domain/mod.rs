// src/domain/mod.rs

//! Domain abstractions shared by the client and server layers.
//!
//! Defines the broker collaborator interface and the envelope types the
//! RPC layer exchanges through it. Nothing here references a concrete
//! messaging system; implementations live under `src/broker/`.

mod broker;

pub use broker::{
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
