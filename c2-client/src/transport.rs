//! Request/response channel to the controller.
//!
//! [`C2Transport`] is the seam the client talks through; [`HttpTransport`] is
//! the production implementation over plain HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

/// Multipart field name the controller reads uploaded files from.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("controller answered HTTP {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait C2Transport: Send + Sync {
    /// POST `body` as JSON and parse the JSON reply.
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, TransportError>;

    /// POST one named binary part and parse the JSON acknowledgement.
    async fn post_file(
        &self,
        url: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<Value, TransportError>;

    /// GET with a JSON body and return the raw reply bytes.
    async fn get_bytes(&self, url: &str, body: &Value) -> Result<Vec<u8>, TransportError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Every request made through this transport gives up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    fn check(response: &reqwest::Response) -> Result<(), TransportError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }

    async fn parse_json(response: reqwest::Response) -> Result<Value, TransportError> {
        Self::check(&response)?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| TransportError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl C2Transport for HttpTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        debug!(%url, "POST json");
        let response = self.client.post(url).json(body).send().await?;
        Self::parse_json(response).await
    }

    async fn post_file(
        &self,
        url: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<Value, TransportError> {
        debug!(%url, file_name, bytes = data.len(), "POST file");
        let part = Part::bytes(data).file_name(file_name.to_string());
        let form = Form::new().part(UPLOAD_FIELD, part);
        let response = self.client.post(url).multipart(form).send().await?;
        Self::parse_json(response).await
    }

    async fn get_bytes(&self, url: &str, body: &Value) -> Result<Vec<u8>, TransportError> {
        debug!(%url, "GET bytes");
        let response = self.client.get(url).json(body).send().await?;
        Self::check(&response)?;
        Ok(response.bytes().await?.to_vec())
    }
}
