//! Bucketstream - bucket caching and streaming for large volumetric datasets

pub mod core;
pub mod streaming;
pub mod store;
pub mod layer;
pub mod debug;

pub use crate::core::{Error, LayerConfig, Result, StreamConfig};
pub use layer::{DataLayer, LayerStats};
