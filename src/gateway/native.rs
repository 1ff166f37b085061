//! In-process dispatch for the gateway.
//!
//! Serves HTTP calls straight from a local `DispatchTable`, skipping the
//! RPC hop. Only JSON payloads (json, form, multipart) are accepted.

use bytes::Bytes;

use crate::codec::Codec;
use crate::context::CallContext;
use crate::errors::NetError;
use crate::server::DispatchTable;

/// Look the handler up by endpoint, then by request path, and run it.
pub async fn call(
    table: &DispatchTable,
    ctx: CallContext,
    path: &str,
    endpoint: &str,
    content_type: &str,
    payload: Bytes,
) -> Result<Bytes, NetError> {
    let codec = table
        .codecs()
        .lookup(content_type)
        .filter(Codec::is_json)
        .ok_or_else(|| NetError::bad_request(format!("native handler does not accept {content_type}")))?;

    let descriptor = table
        .get(endpoint)
        .or_else(|| table.get(path))
        .ok_or_else(|| NetError::not_found(format!("method not found: {endpoint}")))?;

    if descriptor.is_stream() {
        return Err(NetError::bad_request(format!("{} is a stream method", descriptor.name())));
    }
    descriptor.call_unary(ctx, codec, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HandlerError;
    use crate::server::{ApiEndpoint, ServiceBuilder};
    use serde::{Deserialize, Serialize};

    #[derive(Default, Deserialize, Serialize)]
    struct Ping {
        n: i32,
    }

    impl crate::server::Validate for Ping {}

    fn table() -> DispatchTable {
        let service = ServiceBuilder::new("Health", ())
            .unary("Ping", |_svc, _ctx, req: Ping| async move { Ok::<_, HandlerError>(Ping { n: req.n + 1 }) })
            .duplex("Watch", |_svc, _ctx, _stream| async move { Ok::<_, HandlerError>(()) })
            .build();
        let mut table = DispatchTable::new();
        table
            .register_with_endpoints(
                [service],
                &[
                    ApiEndpoint::new("Health.Ping", "/rpc/local/ping"),
                    ApiEndpoint {
                        client_stream: true,
                        server_stream: true,
                        ..ApiEndpoint::new("Health.Watch", "")
                    },
                ],
            )
            .unwrap();
        table
    }

    async fn run(path: &str, endpoint: &str, content_type: &str) -> Result<Bytes, NetError> {
        call(&table(), CallContext::background(), path, endpoint, content_type, Bytes::from_static(br#"{"n":1}"#)).await
    }

    #[tokio::test]
    async fn by_endpoint_then_path() {
        let reply = run("/rpc/x/Health.Ping", "Health.Ping", "application/json").await.unwrap();
        assert_eq!(&reply[..], br#"{"n":2}"#);

        let reply = run("/rpc/local/ping", "ping", "application/json").await.unwrap();
        assert_eq!(&reply[..], br#"{"n":2}"#);
    }

    #[tokio::test]
    async fn rejects_binary_and_streams() {
        assert_eq!(run("/", "Health.Ping", "application/grpc").await.unwrap_err().status, 400);
        assert_eq!(run("/", "Health.Watch", "application/json").await.unwrap_err().status, 400);
        assert_eq!(run("/", "Health.Nope", "application/json").await.unwrap_err().status, 404);
    }
}
