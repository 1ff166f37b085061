use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Structured error body returned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateError {
    pub code: i32,
    pub status: u16,
    pub msg: String,
}

/// Raw reply: HTTP status plus the JSON body.
#[derive(Debug)]
pub struct GateReply {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl GateReply {
    /// Interpret the body as a gateway error, if it has that shape.
    pub fn error(&self) -> Option<GateError> {
        if self.status.is_success() && self.body.get("status").is_none() {
            return None;
        }
        serde_json::from_value(self.body.clone()).ok()
    }
}

pub struct GateClient {
    client: Client,
    gate_url: String,
    prefix: String,
    headers: Vec<(String, String)>,
}

impl GateClient {
    pub fn new(gate_url: &str) -> Self {
        Self {
            client: Client::new(),
            gate_url: gate_url.trim_end_matches('/').to_string(),
            prefix: "/rpc".to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    /// Attach a header to every call (e.g. an auth token).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn endpoint_url(&self, service: &str, endpoint: &str) -> String {
        format!("{}{}/{}/{}", self.gate_url, self.prefix, service, endpoint)
    }

    /// POST a JSON body and return status plus body, whatever the status.
    pub async fn call_raw<Req: Serialize + ?Sized>(
        &self,
        service: &str,
        endpoint: &str,
        req: &Req,
    ) -> Result<GateReply, Box<dyn std::error::Error + Send + Sync>> {
        let mut builder = self.client.post(self.endpoint_url(service, endpoint)).json(req);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text)?
        };

        Ok(GateReply { status, body })
    }

    /// POST a JSON body and decode a successful reply.
    pub async fn call<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        service: &str,
        endpoint: &str,
        req: &Req,
    ) -> Result<Resp, Box<dyn std::error::Error + Send + Sync>> {
        let reply = self.call_raw(service, endpoint, req).await?;

        if let Some(err) = reply.error() {
            return Err(format!("gateway returned {}: {}", err.status, err.msg).into());
        }

        Ok(serde_json::from_value(reply.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_joins_prefix() {
        let client = GateClient::new("http://gate:8080/").with_prefix("/api/");
        assert_eq!(client.endpoint_url("sso", "AuthService.Refresh"), "http://gate:8080/api/sso/AuthService.Refresh");
    }

    #[test]
    fn error_shape_detection() {
        let ok = GateReply {
            status: StatusCode::OK,
            body: serde_json::json!({"id": 1}),
        };
        assert!(ok.error().is_none());

        let business = GateReply {
            status: StatusCode::OK,
            body: serde_json::json!({"code": 7003, "status": 200, "msg": "account locked"}),
        };
        assert_eq!(business.error().unwrap().code, 7003);
    }

    #[tokio::test]
    async fn unreachable_gateway_is_an_error() {
        let client = GateClient::new("http://127.0.0.1:1");
        assert!(client.call_raw("sso", "AuthService.Refresh", &serde_json::json!({})).await.is_err());
    }
}
