//! Pull queue: prioritized, batched fetching of missing buckets.
//!
//! `pull` filters out entries whose bucket no longer needs a request, stable
//! sorts the rest by priority and dispatches batches until `batch_limit`
//! batches are in flight. Every finished batch calls `pull` again, so the
//! queue drains itself.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::config::StreamConfig;
use crate::core::error::{Error, Result};
use crate::store::{BucketSource, StoreResponse};
use crate::streaming::bucket::BucketAddress;
use crate::streaming::connection_info::ConnectionInfo;
use crate::streaming::cube::Cube;
use crate::streaming::lock;

/// Served before everything else and never dropped by `clear_normal_priorities`
pub const PRIORITY_HIGHEST: i32 = -1;

/// A wanted bucket. Lower priority values are served first.
///
/// Normal priorities are non-negative; anything below zero other than
/// `PRIORITY_HIGHEST` is raised to zero when queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub address: BucketAddress,
    pub priority: i32,
}

impl QueueEntry {
    pub fn new(address: BucketAddress, priority: i32) -> Self {
        Self { address, priority }.normalized()
    }

    fn normalized(self) -> Self {
        let priority = match self.priority {
            PRIORITY_HIGHEST => PRIORITY_HIGHEST,
            p => p.max(0),
        };
        Self { priority, ..self }
    }

    pub fn highest(address: BucketAddress) -> Self {
        Self::new(address, PRIORITY_HIGHEST)
    }
}

#[derive(Debug, Clone)]
pub struct PullQueueConfig {
    /// Maximum concurrent in-flight batches
    pub batch_limit: usize,
    /// Maximum addresses per batch
    pub batch_size: usize,
    /// Debug: all-zero buckets are turned white
    pub whiten_empty_buckets: bool,
}

impl Default for PullQueueConfig {
    fn default() -> Self {
        Self {
            batch_limit: 6,
            batch_size: 3,
            whiten_empty_buckets: false,
        }
    }
}

impl From<&StreamConfig> for PullQueueConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            batch_limit: config.pull.batch_limit.max(1),
            batch_size: config.pull_batch_size(),
            whiten_empty_buckets: config.pull.whiten_empty_buckets,
        }
    }
}

#[derive(Default)]
struct PullState {
    queue: Vec<QueueEntry>,
    batch_count: usize,
}

struct PullShared {
    layer_name: String,
    cube: Arc<Mutex<Cube>>,
    source: Arc<dyn BucketSource>,
    connection_info: Arc<ConnectionInfo>,
    config: PullQueueConfig,
    state: Mutex<PullState>,
    in_flight_tx: watch::Sender<usize>,
}

/// Fetches queued buckets from a [`BucketSource`] into a [`Cube`]
#[derive(Clone)]
pub struct PullQueue {
    shared: Arc<PullShared>,
}

impl PullQueue {
    pub fn new(
        layer_name: impl Into<String>,
        cube: Arc<Mutex<Cube>>,
        source: Arc<dyn BucketSource>,
        connection_info: Arc<ConnectionInfo>,
        config: PullQueueConfig,
    ) -> Self {
        let (in_flight_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(PullShared {
                layer_name: layer_name.into(),
                cube,
                source,
                connection_info,
                config: PullQueueConfig {
                    batch_limit: config.batch_limit.max(1),
                    batch_size: config.batch_size.max(1),
                    ..config
                },
                state: Mutex::new(PullState::default()),
                in_flight_tx,
            }),
        }
    }

    pub fn config(&self) -> &PullQueueConfig {
        &self.shared.config
    }

    pub fn add(&self, entry: QueueEntry) {
        lock(&self.shared.state).queue.push(entry.normalized());
    }

    pub fn add_all(&self, entries: impl IntoIterator<Item = QueueEntry>) {
        lock(&self.shared.state)
            .queue
            .extend(entries.into_iter().map(QueueEntry::normalized));
    }

    /// Drop every entry except those at `PRIORITY_HIGHEST`
    pub fn clear_normal_priorities(&self) {
        lock(&self.shared.state)
            .queue
            .retain(|entry| entry.priority == PRIORITY_HIGHEST);
    }

    /// Snapshot of the queued entries
    pub fn entries(&self) -> Vec<QueueEntry> {
        lock(&self.shared.state).queue.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches currently in flight
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.state).batch_count
    }

    /// Dispatch as many batches as the limits allow.
    ///
    /// Returns the handles of the spawned batch tasks. Must be called from
    /// within a tokio runtime.
    pub fn pull(&self) -> Vec<JoinHandle<()>> {
        let batches = self.take_batches();
        batches
            .into_iter()
            .map(|batch| {
                let queue = self.clone();
                tokio::spawn(async move { queue.pull_batch(batch).await })
            })
            .collect()
    }

    fn take_batches(&self) -> Vec<Vec<BucketAddress>> {
        let shared = &self.shared;
        let mut cube = lock(&shared.cube);
        let mut state = lock(&shared.state);

        state.queue.retain(|entry| cube.needs_request(&entry.address));
        // Stable: equal priorities keep insertion order
        state.queue.sort_by_key(|entry| entry.priority);

        let mut batches = Vec::new();
        let mut cursor = 0;
        while state.batch_count < shared.config.batch_limit && cursor < state.queue.len() {
            let mut batch = Vec::with_capacity(shared.config.batch_size);
            while batch.len() < shared.config.batch_size && cursor < state.queue.len() {
                let address = state.queue[cursor].address;
                cursor += 1;

                // The same bucket may be queued more than once
                if !cube.needs_request(&address) {
                    continue;
                }
                if let Err(e) = cube.pull(address) {
                    log::warn!("Skipping bucket {}: {}", address, e);
                    continue;
                }
                batch.push(address);
            }

            if !batch.is_empty() {
                state.batch_count += 1;
                batches.push(batch);
            }
        }
        state.queue.drain(..cursor);

        shared.in_flight_tx.send_replace(state.batch_count);
        batches
    }

    async fn pull_batch(&self, batch: Vec<BucketAddress>) {
        let started = Instant::now();
        log::debug!(
            "{}: pulling {} buckets starting at {}",
            self.shared.layer_name,
            batch.len(),
            batch[0]
        );

        let result = match self.shared.source.request_from_store(&batch).await {
            Ok(response) => self.receive_batch(&batch, response, started),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.handle_failure(&batch, &e);
        }

        lock(&self.shared.state).batch_count -= 1;
        self.pull();
    }

    fn receive_batch(&self, batch: &[BucketAddress], response: StoreResponse, started: Instant) -> Result<()> {
        let shared = &self.shared;
        shared.connection_info.log(
            &shared.layer_name,
            started.elapsed(),
            batch.len(),
            response.data.len(),
        );

        let mut cube = lock(&shared.cube);
        let bucket_length = cube.bucket_length();
        let is_missing = |index: usize| response.missing.contains(&index);
        let present = (0..batch.len()).filter(|&i| !is_missing(i)).count();
        let expected = bucket_length * present;
        if response.data.len() != expected {
            return Err(Error::MalformedBucketData {
                expected,
                actual: response.data.len(),
            });
        }

        let mut chunks = response.data.chunks_exact(bucket_length);
        for (index, address) in batch.iter().enumerate() {
            if is_missing(index) {
                cube.mark_missing(*address)?;
                continue;
            }
            let Some(chunk) = chunks.next() else {
                break;
            };
            let mut bucket_data = chunk.to_vec();
            if shared.config.whiten_empty_buckets {
                whiten_if_empty(&mut bucket_data);
            }
            cube.receive_data(*address, bucket_data)?;
        }
        Ok(())
    }

    fn handle_failure(&self, batch: &[BucketAddress], error: &Error) {
        let mut cube = lock(&self.shared.cube);
        let mut state = lock(&self.shared.state);

        for &address in batch {
            // Buckets already resolved before the failure surfaced are skipped
            if let Ok(true) = cube.pull_failed(address) {
                // Local edits must not be lost: fetch again first thing
                state.queue.push(QueueEntry::highest(address));
            }
        }
        log::error!(
            "{}: pull of {} buckets failed: {}",
            self.shared.layer_name,
            batch.len(),
            error
        );
    }

    /// Wait until no batch is in flight
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.in_flight_tx.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

fn whiten_if_empty(data: &mut [u8]) {
    if data.iter().all(|&b| b == 0) {
        data.fill(255);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MockSource;
    use crate::streaming::bounding_box::BoundingBox;
    use crate::streaming::bucket::{BucketState, BUCKET_VOXELS};

    fn addr(x: i32) -> BucketAddress {
        BucketAddress::new(x, 0, 0, 0)
    }

    fn setup(source: Arc<MockSource>, batch_limit: usize, batch_size: usize) -> (PullQueue, Arc<Mutex<Cube>>) {
        let cube = Arc::new(Mutex::new(Cube::new(
            1,
            BoundingBox::new([-4096, -4096, -4096], [4096, 4096, 4096]),
            10_000,
        )));
        let queue = PullQueue::new(
            "color",
            cube.clone(),
            source,
            Arc::new(ConnectionInfo::new()),
            PullQueueConfig {
                batch_limit,
                batch_size,
                whiten_empty_buckets: false,
            },
        );
        (queue, cube)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_respects_batch_limit_and_size() {
        let source = Arc::new(MockSource::gated(BUCKET_VOXELS, 1));
        let (queue, cube) = setup(source.clone(), 6, 3);

        queue.add_all((0..30).map(|x| QueueEntry::new(addr(x), 1)));
        let handles = queue.pull();
        assert_eq!(handles.len(), 6);
        assert_eq!(queue.in_flight(), 6);
        assert_eq!(queue.len(), 12);

        // A second pull while saturated dispatches nothing
        assert!(queue.pull().is_empty());

        settle().await;
        let calls = source.calls();
        assert_eq!(calls.len(), 6);
        assert!(calls.iter().all(|batch| batch.len() == 3));

        source.open();
        queue.wait_idle().await;

        let calls = source.calls();
        assert_eq!(calls.len(), 10);
        assert!(calls.iter().all(|batch| batch.len() <= 3));
        assert!(source.peak_in_flight() <= 6);
        let cube = lock(&cube);
        assert!((0..30).all(|x| cube.bucket_state(&addr(x)) == BucketState::Loaded));
    }

    #[tokio::test]
    async fn test_priority_order_is_stable() {
        let source = Arc::new(MockSource::new(BUCKET_VOXELS, 1));
        let (queue, _cube) = setup(source.clone(), 1, 1);

        let (a, b, c) = (addr(1), addr(2), addr(3));
        queue.add(QueueEntry::new(a, 5));
        queue.add(QueueEntry::new(b, PRIORITY_HIGHEST));
        queue.add(QueueEntry::new(c, 5));

        queue.pull();
        queue.wait_idle().await;

        assert_eq!(source.calls(), vec![vec![b], vec![a], vec![c]]);
    }

    #[tokio::test]
    async fn test_negative_priority_never_outranks_highest() {
        let source = Arc::new(MockSource::new(BUCKET_VOXELS, 1));
        let (queue, _cube) = setup(source.clone(), 1, 1);

        let (a, b, c) = (addr(1), addr(2), addr(3));
        assert_eq!(QueueEntry::new(a, -5).priority, 0);
        queue.add(QueueEntry::new(a, -5));
        queue.add_all([QueueEntry { address: c, priority: -7 }]);
        queue.add(QueueEntry::highest(b));

        queue.clear_normal_priorities();
        assert_eq!(queue.entries(), vec![QueueEntry::highest(b)]);

        queue.add(QueueEntry { address: a, priority: -5 });
        queue.add(QueueEntry::highest(b));
        queue.pull();
        queue.wait_idle().await;

        assert_eq!(source.calls(), vec![vec![b], vec![a]]);
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_entries_skipped() {
        let source = Arc::new(MockSource::new(BUCKET_VOXELS, 1));
        let (queue, cube) = setup(source.clone(), 6, 3);

        {
            let mut cube = lock(&cube);
            cube.pull(addr(0)).unwrap();
            cube.receive_data(addr(0), vec![0; BUCKET_VOXELS]).unwrap();
        }

        queue.add(QueueEntry::new(addr(0), 0));
        queue.add(QueueEntry::new(addr(1), 0));
        queue.add(QueueEntry::new(addr(1), 2));
        queue.add(QueueEntry::new(addr(2), 1));

        queue.pull();
        queue.wait_idle().await;

        assert_eq!(source.calls(), vec![vec![addr(1), addr(2)]]);
    }

    #[tokio::test]
    async fn test_failure_requeues_dirty_buckets() {
        let source = Arc::new(MockSource::gated(BUCKET_VOXELS, 0));
        let (queue, cube) = setup(source.clone(), 6, 3);
        let (x, y) = (addr(0), addr(1));

        queue.add(QueueEntry::new(x, 0));
        queue.add(QueueEntry::new(y, 0));
        queue.pull();
        settle().await;

        // Edit lands while the fetch is in flight
        lock(&cube).write(x, |data| data[0] = 7).unwrap();

        let error = Error::Fetch(crate::core::error::TransportError::Timeout);
        queue.handle_failure(&[x, y], &error);

        assert_eq!(queue.entries(), vec![QueueEntry::highest(x)]);
        let cube = lock(&cube);
        assert_eq!(cube.bucket_state(&x), BucketState::Unrequested);
        assert_eq!(cube.bucket_state(&y), BucketState::Unrequested);
    }

    #[tokio::test]
    async fn test_failed_batch_refetches_dirty_bucket() {
        let source = Arc::new(MockSource::new(BUCKET_VOXELS, 3));
        source.fail_next();
        let (queue, cube) = setup(source.clone(), 6, 3);
        let (x, y) = (addr(0), addr(1));

        lock(&cube).write(x, |data| data[0] = 7).unwrap();
        queue.add(QueueEntry::new(x, 0));
        queue.add(QueueEntry::new(y, 0));
        queue.pull();
        queue.wait_idle().await;

        assert_eq!(source.calls(), vec![vec![x, y], vec![x]]);
        let cube = lock(&cube);
        assert_eq!(cube.bucket_state(&x), BucketState::Dirty);
        assert_eq!(cube.get_data(&x).unwrap()[0], 7);
        assert_eq!(cube.get_data(&x).unwrap()[1], 3);
        assert_eq!(cube.bucket_state(&y), BucketState::Unrequested);
        assert_eq!(cube.pending_load_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_response_fails_whole_batch() {
        let source = Arc::new(MockSource::new(BUCKET_VOXELS, 1));
        source.script(Ok(StoreResponse {
            data: vec![0; BUCKET_VOXELS],
            missing: Vec::new(),
        }));
        let (queue, cube) = setup(source.clone(), 6, 3);

        queue.add_all([QueueEntry::new(addr(0), 0), QueueEntry::new(addr(1), 0)]);
        queue.pull();
        queue.wait_idle().await;

        let cube = lock(&cube);
        assert_eq!(cube.bucket_state(&addr(0)), BucketState::Unrequested);
        assert_eq!(cube.bucket_state(&addr(1)), BucketState::Unrequested);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_missing_buckets() {
        let source = Arc::new(MockSource::new(BUCKET_VOXELS, 1));
        let mut data = vec![1; BUCKET_VOXELS];
        data.extend(vec![2; BUCKET_VOXELS]);
        source.script(Ok(StoreResponse { data, missing: vec![1] }));
        let (queue, cube) = setup(source.clone(), 6, 3);

        queue.add_all((0..3).map(|x| QueueEntry::new(addr(x), 0)));
        queue.pull();
        queue.wait_idle().await;

        let cube = lock(&cube);
        assert_eq!(cube.get_data(&addr(0)).unwrap()[0], 1);
        assert_eq!(cube.bucket_state(&addr(1)), BucketState::Missing);
        assert_eq!(cube.get_data(&addr(2)).unwrap()[0], 2);
    }

    #[tokio::test]
    async fn test_clear_normal_priorities() {
        let source = Arc::new(MockSource::new(BUCKET_VOXELS, 1));
        let (queue, _cube) = setup(source, 6, 3);

        queue.add(QueueEntry::new(addr(0), 3));
        queue.add(QueueEntry::highest(addr(1)));
        queue.add(QueueEntry::new(addr(2), 0));
        queue.clear_normal_priorities();

        assert_eq!(queue.entries(), vec![QueueEntry::highest(addr(1))]);
    }

    #[tokio::test]
    async fn test_whiten_empty_buckets() {
        let source = Arc::new(MockSource::new(BUCKET_VOXELS, 0));
        let cube = Arc::new(Mutex::new(Cube::new(1, BoundingBox::new([0, 0, 0], [64, 64, 64]), 100)));
        let queue = PullQueue::new(
            "color",
            cube.clone(),
            source,
            Arc::new(ConnectionInfo::new()),
            PullQueueConfig {
                whiten_empty_buckets: true,
                ..Default::default()
            },
        );

        queue.add(QueueEntry::new(addr(0), 0));
        queue.pull();
        queue.wait_idle().await;

        assert!(lock(&cube).get_data(&addr(0)).unwrap().iter().all(|&b| b == 255));
    }

    #[tokio::test]
    async fn test_round_trip_reported() {
        let source = Arc::new(MockSource::new(BUCKET_VOXELS, 1));
        let cube = Arc::new(Mutex::new(Cube::new(1, BoundingBox::new([0, 0, 0], [512, 512, 512]), 100)));
        let info = Arc::new(ConnectionInfo::new());
        let queue = PullQueue::new("color", cube, source, info.clone(), PullQueueConfig::default());

        queue.add_all((0..4).map(|x| QueueEntry::new(addr(x), 0)));
        queue.pull();
        queue.wait_idle().await;

        let stats = info.layer_stats("color").unwrap();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.total_buckets, 4);
        assert_eq!(stats.total_bytes, 4 * BUCKET_VOXELS as u64);
    }
}
