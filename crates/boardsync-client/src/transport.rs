use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};

use crate::config::{ClientConfig, Method};
use crate::error::ClientError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>;

/// Opens one long-lived stream. The client calls `open` again for every reconnect.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self) -> Result<ByteStream, ClientError>;
}

pub struct HttpTransport {
    client: Client,
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: Option<serde_json::Value>,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            method: config.method,
            headers: config.headers.clone(),
            body: config.body.clone(),
        })
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    #[instrument(skip(self), fields(url = %self.url, method = ?self.method))]
    async fn open(&self) -> Result<ByteStream, ClientError> {
        let mut req = match self.method {
            Method::Get => self.client.get(&self.url),
            Method::Post => self.client.post(&self.url),
        };
        req = req.header(ACCEPT, "text/event-stream");
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let (Method::Post, Some(body)) = (self.method, &self.body) {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ClientError::AdmissionRejected { retry_after });
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
            });
        }
        if resp.content_length() == Some(0) {
            return Err(ClientError::MissingBody);
        }

        debug!(status = status.as_u16(), "stream opened");
        Ok(Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(ClientError::from))))
    }
}
