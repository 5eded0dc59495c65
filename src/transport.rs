use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::RequestBody;

/// Network-level failure. Timeouts and connection errors are deliberately not told apart.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct TransportError(pub String);

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, body: &RequestBody) -> Result<TransportResponse, TransportError>;
}

/// Pooled reqwest client shared by every session of a run.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration, verify_tls: bool) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, body: &RequestBody) -> Result<TransportResponse, TransportError> {
        let req = self.client.post(url);
        let req = match body {
            RequestBody::Json(v) => req.json(v),
            RequestBody::Raw(s) => req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(s.clone()),
        };
        let resp = req.send().await.map_err(|e| TransportError(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| TransportError(e.to_string()))?;
        Ok(TransportResponse { status, body })
    }
}
