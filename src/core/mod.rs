//! Core types shared by the streaming queues

pub mod config;
pub mod error;
pub mod logging;

pub use config::{LayerCategory, LayerConfig, PullConfig, PushConfig, StoreType, StreamConfig};
pub use error::{Error, Result, TransportError};
