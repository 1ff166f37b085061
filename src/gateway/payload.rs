//! Request body extraction.
//!
//! ```text
//! application/json                    → body as is
//! application/x-www-form-urlencoded   → {"k":"v1,v2"}
//! multipart/form-data                 → {"field":"text","file":[..bytes..],"filenames":{"file":"a.png"}}
//! octet-stream / proto / grpc family  → body as is
//! ```

use std::collections::BTreeMap;

use axum::extract::{FromRequest, Multipart, Request};
use axum::Form;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::codec::{
    normalize_content_type, APPLICATION_GRPC, APPLICATION_GRPC_PROTO, APPLICATION_JSON, APPLICATION_PROTO,
    APPLICATION_PROTOBUF, FORM_URLENCODED, MULTIPART_FORM, OCTET_STREAM,
};
use crate::errors::NetError;

/// Body encodings the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Json,
    Form,
    Multipart,
    /// Forwarded untouched; the reply is transcoded to JSON.
    Binary,
}

impl PayloadKind {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match normalize_content_type(content_type).as_str() {
            APPLICATION_JSON => Some(Self::Json),
            FORM_URLENCODED => Some(Self::Form),
            MULTIPART_FORM => Some(Self::Multipart),
            OCTET_STREAM | APPLICATION_PROTO | APPLICATION_PROTOBUF | APPLICATION_GRPC | APPLICATION_GRPC_PROTO => {
                Some(Self::Binary)
            }
            _ => None,
        }
    }

    /// Whether the extracted payload is JSON.
    pub fn is_json(&self) -> bool {
        !matches!(self, Self::Binary)
    }
}

/// Read the request body into the payload forwarded to the handler.
pub async fn extract(request: Request, limit: usize) -> Result<(PayloadKind, Bytes), NetError> {
    let content_type = request
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let kind = PayloadKind::from_content_type(&content_type)
        .ok_or_else(|| NetError::bad_request(format!("not support contentType:{content_type}")))?;

    let payload = match kind {
        PayloadKind::Json | PayloadKind::Binary => axum::body::to_bytes(request.into_body(), limit)
            .await
            .map_err(|e| NetError::bad_request(format!("read body: {e}")))?,
        PayloadKind::Form => {
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, &())
                .await
                .map_err(|e| NetError::bad_request(format!("parse form: {e}")))?;
            form_to_json(pairs)?
        }
        PayloadKind::Multipart => {
            let multipart = Multipart::from_request(request, &())
                .await
                .map_err(|e| NetError::bad_request(format!("parse multipart: {e}")))?;
            multipart_to_json(multipart).await?
        }
    };
    Ok((kind, payload))
}

fn form_to_json(pairs: Vec<(String, String)>) -> Result<Bytes, NetError> {
    let mut joined: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        joined.entry(key).or_default().push(value);
    }
    let object: Map<String, Value> = joined
        .into_iter()
        .map(|(k, v)| (k, Value::String(v.join(","))))
        .collect();
    to_bytes(&Value::Object(object))
}

async fn multipart_to_json(mut multipart: Multipart) -> Result<Bytes, NetError> {
    let mut texts: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut object = Map::new();
    let mut filenames = Map::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| NetError::bad_request(format!("parse multipart: {e}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| NetError::bad_request(format!("read file {name}: {e}")))?;
                let bytes = data.iter().map(|b| Value::from(*b)).collect();
                object.insert(name.clone(), Value::Array(bytes));
                filenames.insert(name, Value::String(file_name));
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| NetError::bad_request(format!("read field {name}: {e}")))?;
                texts.entry(name).or_default().push(text);
            }
        }
    }

    for (name, values) in texts {
        object.entry(name).or_insert_with(|| Value::String(values.join(",")));
    }
    if !filenames.is_empty() {
        object.insert("filenames".to_string(), Value::Object(filenames));
    }
    to_bytes(&Value::Object(object))
}

fn to_bytes(value: &Value) -> Result<Bytes, NetError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| NetError::internal(format!("encode payload: {e}")))
}
