//! Streaming configuration.
//!
//! Everything is plain serde data with sensible defaults so a config file only
//! needs to name what differs from the stock data store setup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::streaming::bounding_box::BoundingBox;

/// Kind of remote data store serving the buckets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreType {
    #[default]
    WebknossosStore,
    /// Legacy backend that can only answer one bucket per request
    #[serde(rename = "ndstore")]
    NdStore,
}

/// Category of a data layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerCategory {
    #[default]
    Color,
    Segmentation,
}

/// Per-layer description
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    #[serde(default)]
    pub category: LayerCategory,
    /// Bytes per voxel (1 for uint8 color, 4 for uint32 segmentation, ...)
    #[serde(default = "default_bytes_per_voxel")]
    pub bytes_per_voxel: usize,
    /// Valid volume of the dataset in finest-resolution voxels
    pub bounding_box: BoundingBox,
}

fn default_bytes_per_voxel() -> usize {
    1
}

impl LayerConfig {
    pub fn new(name: impl Into<String>, category: LayerCategory, bounding_box: BoundingBox) -> Self {
        Self {
            name: name.into(),
            category,
            bytes_per_voxel: 1,
            bounding_box,
        }
    }

    pub fn with_bytes_per_voxel(mut self, bytes_per_voxel: usize) -> Self {
        self.bytes_per_voxel = bytes_per_voxel;
        self
    }

    pub fn is_color(&self) -> bool {
        self.category == LayerCategory::Color
    }
}

/// Pull queue knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// Maximum concurrent in-flight batches
    pub batch_limit: usize,
    /// Overrides the store-dependent batch size when set
    pub batch_size: Option<usize>,
    /// Debug: turn all-zero buckets white
    pub whiten_empty_buckets: bool,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            batch_limit: 6,
            batch_size: None,
            whiten_empty_buckets: false,
        }
    }
}

/// Push queue knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Buckets per save request
    pub batch_size: usize,
    pub debounce_ms: u64,
    /// Concurrent save requests
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// When false, pushes run through debounce and dedup but never hit the network
    pub send_data: bool,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            debounce_ms: 1000,
            concurrency: 1,
            max_retries: 3,
            retry_delay_ms: 1000,
            send_data: true,
        }
    }
}

impl PushConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Full streaming configuration for one dataset
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Base URL of the data store, e.g. `https://data.example.org`
    pub data_store_url: String,
    /// Endpoint handing out fresh access tokens
    pub token_url: String,
    /// Endpoint receiving save queue updates
    pub save_url: String,
    pub dataset_name: String,
    pub store_type: StoreType,
    /// Request color data packed as four bits per voxel
    pub four_bit: bool,
    pub request_timeout_ms: u64,
    /// Cache capacity before garbage collection kicks in
    pub max_bucket_count: usize,
    pub pull: PullConfig,
    pub push: PushConfig,
    pub layers: Vec<LayerConfig>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            data_store_url: "http://localhost:9000".to_string(),
            token_url: "http://localhost:9000/api/userToken/generate".to_string(),
            save_url: "http://localhost:9000/api/tracings/update".to_string(),
            dataset_name: String::new(),
            store_type: StoreType::default(),
            four_bit: false,
            request_timeout_ms: 30_000,
            max_bucket_count: 5000,
            pull: PullConfig::default(),
            push: PushConfig::default(),
            layers: Vec::new(),
        }
    }
}

impl StreamConfig {
    /// Addresses per pull batch: the legacy store handles one bucket per request
    pub fn pull_batch_size(&self) -> usize {
        match (self.pull.batch_size, self.store_type) {
            (_, StoreType::NdStore) => 1,
            (Some(size), _) => size.max(1),
            (None, StoreType::WebknossosStore) => 3,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn layer(&self, name: &str) -> Option<&LayerConfig> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pull.batch_limit == 0 {
            return Err(Error::Config("pull.batch_limit must be at least 1".into()));
        }
        if self.push.batch_size == 0 {
            return Err(Error::Config("push.batch_size must be at least 1".into()));
        }
        if self.push.concurrency == 0 {
            return Err(Error::Config("push.concurrency must be at least 1".into()));
        }
        for layer in &self.layers {
            if layer.bytes_per_voxel == 0 {
                return Err(Error::Config(format!("layer {} has zero bytes per voxel", layer.name)));
            }
        }
        Ok(())
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_forks_on_store_type() {
        let mut config = StreamConfig::default();
        assert_eq!(config.pull_batch_size(), 3);

        config.store_type = StoreType::NdStore;
        assert_eq!(config.pull_batch_size(), 1);

        // The legacy store ignores overrides
        config.pull.batch_size = Some(8);
        assert_eq!(config.pull_batch_size(), 1);

        config.store_type = StoreType::WebknossosStore;
        assert_eq!(config.pull_batch_size(), 8);
    }

    #[test]
    fn test_store_type_names() {
        let json = serde_json::to_string(&StoreType::NdStore).unwrap();
        assert_eq!(json, "\"ndstore\"");
        let json = serde_json::to_string(&StoreType::WebknossosStore).unwrap();
        assert_eq!(json, "\"webknossos-store\"");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: StreamConfig = serde_json::from_str(
            r#"{ "dataset_name": "ds", "push": { "debounce_ms": 250 } }"#,
        )
        .unwrap();

        assert_eq!(config.dataset_name, "ds");
        assert_eq!(config.push.debounce_ms, 250);
        assert_eq!(config.push.batch_size, 32);
        assert_eq!(config.pull.batch_limit, 6);
        assert!(config.push.send_data);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = StreamConfig::default();
        config.pull.batch_limit = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/stream.json");

        let mut config = StreamConfig::default();
        config.dataset_name = "cortex".into();
        config.layers.push(LayerConfig::new(
            "color",
            LayerCategory::Color,
            BoundingBox::new([0, 0, 0], [1024, 1024, 512]),
        ));
        config.save_sync(&path).unwrap();

        let loaded = StreamConfig::load_sync(&path).unwrap();
        assert_eq!(loaded.dataset_name, "cortex");
        assert_eq!(loaded.layer("color").unwrap().bounding_box.max, [1024, 1024, 512]);
        assert!(loaded.layer("segmentation").is_none());
    }
}
