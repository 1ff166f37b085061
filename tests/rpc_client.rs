//! Direct client calls against a live RPC server.

use std::time::Duration;

use rpc_gate::client::{ClientOptions, PoolConfig};
use rpc_gate::metadata::X_CONTENT_TYPE;
use rpc_gate::{CallContext, Metadata};

mod common;

use common::{CountReq, RefreshReq, RefreshResp, SleepReq};

fn json_ctx() -> CallContext {
    CallContext::new(Metadata::new().with(X_CONTENT_TYPE, "application/json"))
}

#[tokio::test]
async fn typed_unary_with_default_codec() {
    let h = common::start().await;
    let svc = h.client.target("sso");
    assert_eq!(svc.addr(), h.rpc_addr.to_string());

    let resp: RefreshResp = svc
        .invoke(&CallContext::background(), "sso", "AuthService.Refresh", &RefreshReq { id: 42 })
        .await
        .unwrap();
    assert_eq!(resp, RefreshResp { id: 100042 });

    let stats = h.client.pools().stats(svc.addr()).unwrap();
    assert_eq!(stats.open, 1);
}

#[tokio::test]
async fn json_codec_and_business_error() {
    let h = common::start().await;
    let err = h
        .client
        .target("sso")
        .invoke::<_, RefreshResp>(&json_ctx(), "sso", "AuthService.Locked", &RefreshReq::default())
        .await
        .unwrap_err();
    assert_eq!((err.code, err.status), (7003, 200));

    // An errored call closes its connection instead of idling it.
    let stats = h.client.pools().stats(&h.rpc_addr.to_string()).unwrap();
    assert_eq!((stats.open, stats.idle), (0, 0));

    let resp: RefreshResp = h
        .client
        .target("sso")
        .invoke(&json_ctx(), "sso", "AuthService.Refresh", &RefreshReq { id: 2 })
        .await
        .unwrap();
    assert_eq!(resp.id, 100002);
    assert_eq!(h.client.pools().stats(&h.rpc_addr.to_string()).unwrap().open, 1);
}

#[tokio::test]
async fn deadline_cuts_the_call() {
    let h = common::start().await;
    let ctx = CallContext::background().with_timeout(Duration::from_millis(100));
    let err = h
        .client
        .target("sso")
        .invoke::<_, RefreshResp>(&ctx, "sso", "AuthService.Sleep", &SleepReq { millis: 2_000 })
        .await
        .unwrap_err();
    assert_eq!(err.status, 408);
}

#[tokio::test]
async fn unavailable_evicts_the_address() {
    let h = common::start().await;
    let svc = h.client.target("sso");
    let err = svc
        .invoke::<_, RefreshResp>(&CallContext::background(), "sso", "AuthService.Down", &RefreshReq::default())
        .await
        .unwrap_err();
    assert_eq!(err.status, 503);
    assert!(h.client.pools().stats(svc.addr()).is_none());

    // The next call dials afresh.
    let resp: RefreshResp = svc
        .invoke(&CallContext::background(), "sso", "AuthService.Refresh", &RefreshReq { id: 1 })
        .await
        .unwrap();
    assert_eq!(resp.id, 100001);
}

#[tokio::test]
async fn stream_cap_opens_second_connection() {
    let options = ClientOptions {
        pool: PoolConfig::new(10, Duration::from_secs(60), 10, 1),
        ..ClientOptions::default()
    };
    let h = common::start_with(options).await;
    let svc = h.client.target("sso");

    let slow = |millis| {
        let svc = svc.clone();
        async move {
            svc.invoke::<_, RefreshResp>(&CallContext::background(), "sso", "AuthService.Sleep", &SleepReq { millis })
                .await
        }
    };
    let (a, b) = tokio::join!(slow(300), slow(300));
    assert_eq!(a.unwrap().id, 300);
    assert_eq!(b.unwrap().id, 300);

    let stats = h.client.pools().stats(svc.addr()).unwrap();
    assert_eq!(stats.open, 2);
}

#[tokio::test]
async fn duplex_echo_and_server_stream() {
    let h = common::start().await;
    let svc = h.client.target("stream");

    let mut echo = svc.new_stream(&json_ctx(), "stream", "StreamService.Echo").await.unwrap();
    echo.send(&serde_json::json!({"n": 1})).await.unwrap();
    let got: serde_json::Value = echo.recv().await.unwrap().unwrap();
    assert_eq!(got["n"], 1);
    echo.close_send();
    assert!(echo.recv::<serde_json::Value>().await.unwrap().is_none());
    assert!(echo.is_closed());

    let mut count = svc
        .new_stream(&CallContext::background(), "stream", "StreamService.Count")
        .await
        .unwrap();
    count.send(&CountReq { n: 3 }).await.unwrap();
    let mut ids = Vec::new();
    while let Some(resp) = count.recv::<RefreshResp>().await.unwrap() {
        ids.push(resp.id);
    }
    assert_eq!(ids, vec![0, 1, 2]);
}

#[tokio::test]
async fn unknown_stream_method_fails() {
    let h = common::start().await;
    let mut stream = h
        .client
        .target("stream")
        .new_stream(&json_ctx(), "stream", "StreamService.Nope")
        .await;
    // The server may reject before or after headers; either way the call errors.
    let err = match stream.as_mut() {
        Ok(stream) => stream.recv_raw().await.unwrap_err(),
        Err(err) => err.clone(),
    };
    assert!(err.msg.contains("method not found"));
}
