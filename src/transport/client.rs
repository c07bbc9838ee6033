//! Dashboard REST client
//!
//! HTTP client for the dashboard backend's `/api/devices` endpoints.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

use super::error::{ClientError, ClientResult};
use super::HistorySource;
use crate::config::CloudConfig;
use crate::streams::FetchError;

/// REST client for the dashboard backend
#[derive(Debug, Clone)]
pub struct CloudClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct SerialRequest<'a> {
    data: &'a str,
    node: &'a str,
    encoded: bool,
}

impl CloudClient {
    pub fn new(config: &CloudConfig) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the history endpoint for one stream
    ///
    /// The stream name is `<device>/<topic>`; each path segment is
    /// percent-encoded on its own so the topic's `/` separators survive.
    pub fn stream_url(&self, device_id: &str, topic: &str) -> String {
        let device = urlencoding::encode(device_id);
        let topic: Vec<_> = topic.split('/').map(urlencoding::encode).collect();
        format!(
            "{}/api/devices/{}/data/{}/{}",
            self.base_url,
            device,
            device,
            topic.join("/")
        )
    }

    /// Fetch the stored data points of one stream
    pub async fn stream_history(&self, device_id: &str, topic: &str) -> ClientResult<Value> {
        if device_id.is_empty() || topic.is_empty() {
            return Err(ClientError::InvalidArgument(
                "device id and topic are required".to_string(),
            ));
        }

        let url = self.stream_url(device_id, topic);
        tracing::debug!(url = %url, "Fetching stream history");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ClientError::from_send)?;

        let response = check_status(response).await?;
        let body: Value = response.json().await?;
        Ok(body)
    }

    /// List the devices on the account
    pub async fn devices(&self) -> ClientResult<Vec<Value>> {
        let url = format!("{}/api/devices", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ClientError::from_send)?;

        let response = check_status(response).await?;
        let body: Value = response.json().await?;

        Ok(match body {
            Value::Object(mut obj) => match obj.remove("items") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        })
    }

    /// Set one output on a radio
    ///
    /// Sends `{ext_addr: {name: value}}` to the gateway's I/O endpoint.
    pub async fn output(
        &self,
        device_id: &str,
        ext_addr: &str,
        name: &str,
        value: Value,
    ) -> ClientResult<()> {
        if ext_addr.is_empty() {
            return Err(ClientError::InvalidArgument(
                "no radio address passed to output".to_string(),
            ));
        }
        if name.is_empty() {
            return Err(ClientError::InvalidArgument(
                "no name passed to output".to_string(),
            ));
        }
        if value.is_null() {
            return Err(ClientError::InvalidArgument(
                "no value passed to output".to_string(),
            ));
        }

        let mut outputs = Map::new();
        outputs.insert(name.to_string(), value);
        let mut body = Map::new();
        body.insert(ext_addr.to_string(), Value::Object(outputs));

        self.output_batch(device_id, body).await
    }

    /// Send a prebuilt `{ext_addr: {name: value, ...}, ...}` object
    pub async fn output_batch(&self, device_id: &str, body: Map<String, Value>) -> ClientResult<()> {
        if device_id.is_empty() {
            return Err(ClientError::InvalidArgument(
                "no device passed to output".to_string(),
            ));
        }
        if body.is_empty() {
            return Err(ClientError::InvalidArgument(
                "no data passed to output".to_string(),
            ));
        }

        let url = format!(
            "{}/api/devices/{}/io",
            self.base_url,
            urlencoding::encode(device_id)
        );

        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(ClientError::from_send)?;

        check_status(response).await?;
        Ok(())
    }

    /// Send serial data to a node through its gateway
    pub async fn send_serial(
        &self,
        gateway: &str,
        node: &str,
        data: &str,
        encoded: bool,
    ) -> ClientResult<()> {
        if gateway.is_empty() {
            return Err(ClientError::InvalidArgument(
                "invalid gateway argument to send_serial".to_string(),
            ));
        }
        if node.is_empty() {
            return Err(ClientError::InvalidArgument(
                "invalid node argument to send_serial".to_string(),
            ));
        }

        let url = format!(
            "{}/api/devices/{}/serial",
            self.base_url,
            urlencoding::encode(gateway)
        );
        let body = SerialRequest {
            data,
            node,
            encoded,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ClientError::from_send)?;

        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> ClientResult<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Err(ClientError::Api {
            status: status.as_u16(),
            message: text,
        })
    }
}

#[async_trait]
impl HistorySource for CloudClient {
    async fn fetch_history(&self, device_id: &str, topic: &str) -> Result<Value, FetchError> {
        self.stream_history(device_id, topic)
            .await
            .map_err(FetchError::from)
    }
}
