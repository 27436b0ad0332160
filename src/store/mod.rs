//! Network boundary: remote data store reads and save queue writes

pub mod http;
pub mod save_queue;
pub mod token;
pub mod wire;
pub mod wkstore;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::{Result, TransportError};
use crate::streaming::bucket::BucketAddress;

pub use http::ReqwestTransport;
pub use save_queue::{ChannelSaveQueue, HttpSaveQueue};
pub use token::TokenProvider;
pub use wire::{SaveQueueAction, SaveQueueItem, UpdateBucket};
pub use wkstore::WkStoreAdapter;

/// Raw binary answer to a data request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryResponse {
    pub body: Vec<u8>,
    /// Request indices the store has no data for (`MISSING-BUCKETS` header)
    pub missing_buckets: Vec<usize>,
}

/// Decoded answer to one pull batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreResponse {
    /// Present buckets back to back, in request order
    pub data: Vec<u8>,
    /// Indices into the batch of buckets absent upstream
    pub missing: Vec<usize>,
}

/// HTTP-level transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON body, receive a binary body
    async fn send_json_receive_arraybuffer(
        &self,
        url: &str,
        body: &Value,
    ) -> std::result::Result<BinaryResponse, TransportError>;

    /// POST a JSON body, ignore the response body
    async fn send_json(&self, url: &str, body: &Value) -> std::result::Result<(), TransportError>;

    /// GET a JSON document
    async fn receive_json(&self, url: &str) -> std::result::Result<Value, TransportError>;
}

/// Source of bucket data for the pull queue
#[async_trait]
pub trait BucketSource: Send + Sync {
    /// Fetch one batch of buckets
    async fn request_from_store(&self, batch: &[BucketAddress]) -> Result<StoreResponse>;
}

/// Sink for push batches
#[async_trait]
pub trait SaveQueue: Send + Sync {
    async fn push_save_queue(&self, action: SaveQueueAction) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing;
