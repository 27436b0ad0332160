//! Adapter for the webknossos-style data store

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::config::{LayerConfig, StreamConfig};
use crate::core::error::Result;
use crate::store::token::TokenProvider;
use crate::store::wire::{decode_four_bit, BucketRequest, DataRequest};
use crate::store::{BucketSource, StoreResponse, Transport};
use crate::streaming::bucket::BucketAddress;

/// Fetches bucket batches for one layer
pub struct WkStoreAdapter {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenProvider>,
    data_url: String,
    layer: LayerConfig,
    four_bit: bool,
    timeout: Duration,
}

impl WkStoreAdapter {
    pub fn new(
        config: &StreamConfig,
        layer: LayerConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenProvider>,
    ) -> Self {
        let data_url = format!(
            "{}/data/datasets/{}/layers/{}/data",
            config.data_store_url.trim_end_matches('/'),
            config.dataset_name,
            layer.name,
        );
        Self {
            transport,
            tokens,
            data_url,
            // Four-bit packing only makes sense for color data
            four_bit: config.four_bit && layer.is_color(),
            layer,
            timeout: config.request_timeout(),
        }
    }

    pub fn layer(&self) -> &LayerConfig {
        &self.layer
    }

    pub fn is_four_bit(&self) -> bool {
        self.four_bit
    }

    /// Request body for a batch
    pub fn build_request(&self, batch: &[BucketAddress]) -> DataRequest {
        DataRequest {
            data: batch
                .iter()
                .map(|address| BucketRequest::new(address, self.four_bit))
                .collect(),
            timeout: self.timeout.as_millis() as u64,
        }
    }
}

#[async_trait]
impl BucketSource for WkStoreAdapter {
    async fn request_from_store(&self, batch: &[BucketAddress]) -> Result<StoreResponse> {
        let body = serde_json::to_value(self.build_request(batch))?;

        let response = self
            .tokens
            .do_with_token(|token| {
                let url = format!("{}?token={}", self.data_url, token);
                let body = &body;
                async move { self.transport.send_json_receive_arraybuffer(&url, body).await }
            })
            .await?;

        let data = if self.four_bit {
            decode_four_bit(&response.body)
        } else {
            response.body
        };
        Ok(StoreResponse {
            data,
            missing: response.missing_buckets,
        })
    }
}
