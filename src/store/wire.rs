//! JSON wire formats for the data store and the save queue

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::streaming::bucket::{BucketAddress, BUCKET_WIDTH};

/// One bucket in a data request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketRequest {
    pub position: [i32; 3],
    pub zoom_step: u32,
    pub cube_size: usize,
    pub four_bit: bool,
}

impl BucketRequest {
    pub fn new(address: &BucketAddress, four_bit: bool) -> Self {
        Self {
            position: address.top_left_voxel(),
            zoom_step: address.zoom_step,
            cube_size: BUCKET_WIDTH,
            four_bit,
        }
    }
}

/// Body of `POST .../layers/{layer}/data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub data: Vec<BucketRequest>,
    /// Milliseconds
    pub timeout: u64,
}

/// Payload of an `updateBucket` save queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBucket {
    pub position: [i32; 3],
    pub zoom_step: u32,
    pub cube_size: usize,
    pub base64_data: String,
}

impl UpdateBucket {
    pub fn new(address: &BucketAddress, data: &[u8]) -> Self {
        Self {
            position: address.top_left_voxel(),
            zoom_step: address.zoom_step,
            cube_size: BUCKET_WIDTH,
            base64_data: BASE64.encode(data),
        }
    }

    /// Raw bucket bytes carried by this item
    pub fn decode_data(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.base64_data)
            .map_err(|e| Error::Config(format!("invalid base64 bucket data: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value")]
pub enum SaveQueueItem {
    #[serde(rename = "updateBucket")]
    UpdateBucket(UpdateBucket),
}

/// Action handed to the save queue, one per push batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SaveQueueAction {
    #[serde(rename = "PUSH_SAVE_QUEUE")]
    PushSaveQueue { items: Vec<SaveQueueItem> },
}

impl SaveQueueAction {
    pub fn items(&self) -> &[SaveQueueItem] {
        match self {
            SaveQueueAction::PushSaveQueue { items } => items,
        }
    }
}

/// Expand four-bit packed voxels: high nibble first, each scaled to 8 bits
pub fn decode_four_bit(packed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packed.len() * 2);
    for &byte in packed {
        out.push(byte & 0xF0);
        out.push(byte << 4);
    }
    out
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub token: String,
}
