// src/server/handler.rs

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Boxed future returned by [`Handler::handle`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>;

/// A unit of server-side work.
///
/// Handlers receive the request payload as opaque bytes and produce the
/// response payload. Any async closure `Fn(Bytes) -> Future<Output =
/// Result<Bytes>>` is a handler via the blanket impl; [`typed_handler`]
/// adds JSON (de)serialization on top.
///
/// A handler returning `Err` causes the delivery to be rejected without
/// requeue and no response to be published.
pub trait Handler: Send + Sync + 'static {
    /// Process one request body.
    fn handle(&self, body: Bytes) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    fn handle(&self, body: Bytes) -> HandlerFuture {
        Box::pin((self)(body))
    }
}

/// Wrap a typed async function into a byte-level [`Handler`].
///
/// The request body is JSON-decoded into `Req` and the response is
/// JSON-encoded from `Resp`. Decode failures surface as handler errors,
/// so a malformed request is rejected without requeue like any other
/// handler fault.
pub fn typed_handler<F, Fut, Req, Resp>(handler: F) -> impl Handler
where
    F: Fn(Req) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // ---
    move |body: Bytes| {
        let handler = handler.clone();
        async move {
            // ---
            let request: Req = serde_json::from_slice(&body)?;
            let response: Resp = handler(request).await?;
            Ok(Bytes::from(serde_json::to_vec(&response)?))
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    #[tokio::test]
    async fn typed_handler_round_trips_json() {
        // ---
        let handler = typed_handler(|req: Echo| async move {
            Ok(Echo {
                text: req.text.to_uppercase(),
            })
        });

        let body = Bytes::from(serde_json::to_vec(&Echo { text: "hi".into() }).unwrap());
        let out = handler.handle(body).await.unwrap();

        let echoed: Echo = serde_json::from_slice(&out).unwrap();
        assert_eq!(echoed.text, "HI");
    }

    #[tokio::test]
    async fn typed_handler_rejects_malformed_request() {
        // ---
        let handler = typed_handler(|req: Echo| async move { Ok(req) });
        let result = handler.handle(Bytes::from_static(b"not json")).await;
        assert!(result.is_err());
    }
}
