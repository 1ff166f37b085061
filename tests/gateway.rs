//! HTTP calls through the gateway into a live RPC server.

use std::sync::atomic::Ordering;

use reqwest::StatusCode;
use serde_json::json;

mod common;

#[tokio::test]
async fn refresh_through_gateway() {
    let h = common::start().await;

    let reply = h.gate().call_raw("sso", "AuthService.Refresh", &json!({"id": 111})).await.unwrap();
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["id"], 100111);
    assert_eq!(h.auth.calls.load(Ordering::SeqCst), 1);

    let typed: common::RefreshResp = h
        .gate()
        .call("sso", "AuthService.Refresh", &common::RefreshReq { id: 1 })
        .await
        .unwrap();
    assert_eq!(typed.id, 100001);
}

#[tokio::test]
async fn missing_token_is_401_and_handler_not_called() {
    let h = common::start().await;

    let anonymous = gate_sdk::GateClient::new(&h.gateway_url);
    let reply = anonymous.call_raw("sso", "AuthService.Refresh", &json!({"id": 111})).await.unwrap();
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let err = reply.error().unwrap();
    assert_eq!(err.status, 401);
    assert_eq!(h.auth.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn wrong_token_is_403() {
    let h = common::start().await;

    let client = gate_sdk::GateClient::new(&h.gateway_url).with_header(common::AUTH_HEADER, "nope");
    let reply = client.call_raw("sso", "AuthService.Refresh", &json!({})).await.unwrap();
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(h.auth.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn business_and_validation_errors() {
    let h = common::start().await;

    let reply = h.gate().call_raw("sso", "AuthService.Locked", &json!({})).await.unwrap();
    assert_eq!(reply.status, StatusCode::OK);
    let err = reply.error().unwrap();
    assert_eq!((err.code, err.msg.as_str()), (7003, "account locked"));

    let reply = h.gate().call_raw("sso", "AuthService.Refresh", &json!({"id": -1})).await.unwrap();
    let err = reply.error().unwrap();
    assert_eq!(err.code, -1);
    assert!(err.msg.starts_with("param error"));
    assert_eq!(h.auth.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_method_is_404() {
    let h = common::start().await;
    let reply = h.gate().call_raw("sso", "AuthService.Missing", &json!({})).await.unwrap();
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn form_and_binary_payloads() {
    let h = common::start().await;
    let http = reqwest::Client::new();
    let url = format!("{}/rpc/sso/AuthService.Refresh", h.gateway_url);

    let resp = http
        .post(&url)
        .header(common::AUTH_HEADER, common::TOKEN)
        .form(&[("id", "5")])
        .send()
        .await
        .unwrap();
    // Form values arrive as strings, which the typed request rejects.
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = rmp_serde::to_vec_named(&common::RefreshReq { id: 9 }).unwrap();
    let resp = http
        .post(&url)
        .header(common::AUTH_HEADER, common::TOKEN)
        .header("content-type", "application/octet-stream")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/json; charset=utf-8");
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["id"], 100009);

    let resp = http
        .post(&url)
        .header(common::AUTH_HEADER, common::TOKEN)
        .header("content-type", "text/plain")
        .body("id=1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
}

#[tokio::test]
async fn unreachable_service_is_an_error_response() {
    let h = common::start().await;
    // Not mapped: resolves to "nowhere.invalid:10000".
    let reply = h.gate().call_raw("nowhere.invalid", "AuthService.Refresh", &json!({})).await.unwrap();
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert!(reply.error().is_some());
}
