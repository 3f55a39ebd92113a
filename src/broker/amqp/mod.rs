// src/broker/amqp/mod.rs

//! AMQP broker implementation (lapin).

mod lapin;

pub use lapin::create_amqp_broker;
