// src/server/mod.rs

//! Bounded dispatcher: consumes the request queue under a concurrency
//! ceiling and publishes correlated replies.

mod dispatcher;
mod handler;

pub use dispatcher::Dispatcher;
pub use handler::{typed_handler, Handler, HandlerFuture};
