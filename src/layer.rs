//! Per-layer facade wiring a cube to its pull and push queues.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::core::config::{LayerConfig, StreamConfig};
use crate::core::error::Result;
use crate::store::{BucketSource, SaveQueue, TokenProvider, Transport, WkStoreAdapter};
use crate::streaming::{
    lock, BucketAddress, BucketState, ConnectionInfo, ConnectionStats, Cube, CubeStats, PullQueue,
    PullQueueConfig, PushQueue, PushQueueConfig, QueueEntry,
};

/// Snapshot of one layer's streaming state
#[derive(Debug, Clone)]
pub struct LayerStats {
    pub cube: CubeStats,
    pub queued_pulls: usize,
    pub in_flight_batches: usize,
    pub pending_pushes: usize,
    pub state_saved: bool,
    pub save_error: bool,
    pub connection: Option<ConnectionStats>,
}

/// One data layer: its bucket cache plus the queues that fill and persist it
#[derive(Clone)]
pub struct DataLayer {
    config: LayerConfig,
    cube: Arc<Mutex<Cube>>,
    pull_queue: PullQueue,
    push_queue: PushQueue,
    connection_info: Arc<ConnectionInfo>,
}

impl DataLayer {
    pub fn new(
        stream: &StreamConfig,
        config: LayerConfig,
        source: Arc<dyn BucketSource>,
        save_queue: Arc<dyn SaveQueue>,
        connection_info: Arc<ConnectionInfo>,
    ) -> Self {
        let cube = Arc::new(Mutex::new(Cube::new(
            config.bytes_per_voxel,
            config.bounding_box,
            stream.max_bucket_count,
        )));
        let pull_queue = PullQueue::new(
            config.name.clone(),
            cube.clone(),
            source,
            connection_info.clone(),
            PullQueueConfig::from(stream),
        );
        let push_queue = PushQueue::new(cube.clone(), save_queue, PushQueueConfig::from(stream));

        log::info!(
            "Layer {} ready ({} bytes per bucket)",
            config.name,
            lock(&cube).bucket_length()
        );
        Self {
            config,
            cube,
            pull_queue,
            push_queue,
            connection_info,
        }
    }

    /// Layer backed by the remote data store
    pub fn connect(
        stream: &StreamConfig,
        config: LayerConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenProvider>,
        save_queue: Arc<dyn SaveQueue>,
        connection_info: Arc<ConnectionInfo>,
    ) -> Self {
        let source = Arc::new(WkStoreAdapter::new(stream, config.clone(), transport, tokens));
        Self::new(stream, config, source, save_queue, connection_info)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn cube(&self) -> &Arc<Mutex<Cube>> {
        &self.cube
    }

    pub fn pull_queue(&self) -> &PullQueue {
        &self.pull_queue
    }

    pub fn push_queue(&self) -> &PushQueue {
        &self.push_queue
    }

    /// Ask for a bucket and start fetching if capacity allows
    pub fn request_bucket(&self, address: BucketAddress, priority: i32) -> Vec<JoinHandle<()>> {
        self.request_buckets([QueueEntry::new(address, priority)])
    }

    pub fn request_buckets(&self, entries: impl IntoIterator<Item = QueueEntry>) -> Vec<JoinHandle<()>> {
        self.pull_queue.add_all(entries);
        self.pull_queue.pull()
    }

    /// Edit a bucket's voxels and schedule the write-back.
    ///
    /// A bucket without upstream data yet is fetched at the highest priority
    /// so the edit can be merged and saved.
    pub fn write_bucket<F>(&self, address: BucketAddress, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let needs_request = {
            let mut cube = lock(&self.cube);
            cube.write(address, mutate)?;
            cube.needs_request(&address)
        };
        if needs_request {
            self.pull_queue.add(QueueEntry::highest(address));
            self.pull_queue.pull();
        }
        self.push_queue.insert(address);
        Ok(())
    }

    pub fn bucket_state(&self, address: &BucketAddress) -> BucketState {
        lock(&self.cube).bucket_state(address)
    }

    /// Copy of a bucket's voxels
    pub fn bucket_data(&self, address: &BucketAddress) -> Result<Vec<u8>> {
        lock(&self.cube).get_data(address).map(<[u8]>::to_vec)
    }

    pub fn state_saved(&self) -> bool {
        self.push_queue.state_saved()
    }

    /// Push every pending edit now and wait for it to be persisted
    pub async fn flush(&self) -> Result<()> {
        self.push_queue.push_now().await
    }

    pub fn clear_normal_priorities(&self) {
        self.pull_queue.clear_normal_priorities();
    }

    /// Evict cached buckets beyond capacity
    pub fn collect_garbage(&self) -> usize {
        lock(&self.cube).collect_garbage()
    }

    pub fn stats(&self) -> LayerStats {
        LayerStats {
            cube: lock(&self.cube).stats(),
            queued_pulls: self.pull_queue.len(),
            in_flight_batches: self.pull_queue.in_flight(),
            pending_pushes: self.push_queue.pending().len(),
            state_saved: self.push_queue.state_saved(),
            save_error: self.push_queue.save_error(),
            connection: self.connection_info.layer_stats(&self.config.name),
        }
    }
}
