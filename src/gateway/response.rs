//! Gateway responses.
//!
//! Success bodies are JSON with `application/json; charset=utf-8`. Errors
//! are the `NetError` JSON followed by a newline, with the HTTP status
//! taken from the error.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::errors::NetError;

pub const JSON_UTF8: &str = "application/json; charset=utf-8";

pub fn json_response(body: Bytes) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_UTF8));
    response
}

pub fn error_response(err: &NetError) -> Response {
    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = err.to_json();
    body.push('\n');

    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_UTF8));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

impl IntoResponse for NetError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}
