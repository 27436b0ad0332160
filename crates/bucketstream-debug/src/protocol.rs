//! Debug protocol - JSON command/response definitions

use serde::{Deserialize, Serialize};

/// Commands accepted by the debug server, one JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum DebugCommand {
    /// Health check
    Ping,
    /// Names and kinds of all registered layers
    ListLayers,
    /// Cache, queue and connection statistics for one layer
    GetLayerStats { layer: String },
    /// State of a single bucket
    GetBucketState {
        layer: String,
        x: i32,
        y: i32,
        z: i32,
        zoom_step: u32,
    },
    /// Drop speculative pull requests of a layer
    ClearNormalPriorities { layer: String },
    /// Push pending edits of a layer without waiting for the debounce window
    SchedulePush { layer: String },
}

/// Responses from debug server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DebugResponse {
    #[serde(rename = "ok")]
    Ok { data: ResponseData },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    None,
    Pong { message: String },
    Layers { layers: Vec<LayerInfo> },
    LayerStats {
        layer: String,
        buckets: BucketCounts,
        queued_pulls: usize,
        in_flight_batches: usize,
        pending_pushes: usize,
        state_saved: bool,
        save_error: bool,
        connection: Option<ConnectionInfo>,
    },
    BucketState {
        layer: String,
        address: [i32; 4],
        state: String,
    },
    Updated { description: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    pub category: String,
    pub bytes_per_voxel: usize,
}

/// Bucket counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub total: usize,
    pub unrequested: usize,
    pub requested: usize,
    pub loaded: usize,
    pub missing: usize,
    pub dirty: usize,
    pub pushing: usize,
    pub pending_load: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub round_trip_ms: f64,
    pub bandwidth: f64,
    pub requests: u64,
    pub total_buckets: u64,
    pub total_bytes: u64,
}

impl DebugResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self::Ok { data }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            message: msg.into(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(ResponseData::Pong {
            message: "pong".into(),
        })
    }

    pub fn none() -> Self {
        Self::ok(ResponseData::None)
    }

    pub fn updated(description: impl Into<String>) -> Self {
        Self::ok(ResponseData::Updated {
            description: description.into(),
        })
    }

    pub fn unknown_layer(layer: &str) -> Self {
        Self::error(format!("Unknown layer: {}", layer))
    }
}
