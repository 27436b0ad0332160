//! reqwest-backed transport

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::{Error, Result, TransportError};
use crate::store::{BinaryResponse, Transport};

/// Header listing request indices the store has no data for
pub const MISSING_BUCKETS_HEADER: &str = "MISSING-BUCKETS";

/// HTTP transport over a shared reqwest client
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client init failed: {e}")))?;
        Ok(Self { client })
    }
}

fn map_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = e.status() {
        TransportError::Status(status.as_u16())
    } else {
        TransportError::Network(e.to_string())
    }
}

fn check_status(response: reqwest::Response) -> std::result::Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Status(status.as_u16()))
    }
}

/// Parse the missing bucket header, e.g. `[0, 2]`
pub fn parse_missing_buckets(header: Option<&str>) -> Vec<usize> {
    header
        .and_then(|value| serde_json::from_str::<Vec<usize>>(value).ok())
        .unwrap_or_default()
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send_json_receive_arraybuffer(
        &self,
        url: &str,
        body: &Value,
    ) -> std::result::Result<BinaryResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(map_error)?;
        let response = check_status(response)?;

        let missing_buckets = parse_missing_buckets(
            response
                .headers()
                .get(MISSING_BUCKETS_HEADER)
                .and_then(|value| value.to_str().ok()),
        );
        let body = response.bytes().await.map_err(map_error)?.to_vec();

        Ok(BinaryResponse {
            body,
            missing_buckets,
        })
    }

    async fn send_json(&self, url: &str, body: &Value) -> std::result::Result<(), TransportError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(map_error)?;
        check_status(response)?;
        Ok(())
    }

    async fn receive_json(&self, url: &str) -> std::result::Result<Value, TransportError> {
        let response = self.client.get(url).send().await.map_err(map_error)?;
        let response = check_status(response)?;
        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Network(format!("invalid JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_missing_buckets() {
        assert_eq!(parse_missing_buckets(Some("[0, 2]")), vec![0, 2]);
        assert_eq!(parse_missing_buckets(Some("[]")), Vec::<usize>::new());
        assert_eq!(parse_missing_buckets(Some("garbage")), Vec::<usize>::new());
        assert_eq!(parse_missing_buckets(None), Vec::<usize>::new());
    }

    #[test]
    fn test_client_builds() {
        assert!(ReqwestTransport::new(Duration::from_secs(5)).is_ok());
    }
}
