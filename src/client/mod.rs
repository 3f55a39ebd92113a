// src/client/mod.rs

//! Client coordinator: publishes request envelopes and waits for correlated
//! replies on a private reply queue.

mod pending;
mod rpc_client;

pub(crate) use pending::PendingRequests;
pub use rpc_client::RpcClient;
