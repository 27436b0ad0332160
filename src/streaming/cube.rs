//! Cube: the address-keyed bucket cache of one data layer
//!
//! The cube is the single owner of every bucket. Queues refer to buckets by
//! address and drive their state machine through the methods here, which keep
//! the set of "not yet fully loaded" edited buckets in sync.

use std::collections::{HashMap, HashSet};

use tokio::sync::watch;

use crate::core::error::{Error, Result};
use crate::streaming::bounding_box::BoundingBox;
use crate::streaming::bucket::{Bucket, BucketAddress, BucketState, BUCKET_VOXELS};

/// Bucket counts per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CubeStats {
    pub total: usize,
    pub unrequested: usize,
    pub requested: usize,
    pub loaded: usize,
    pub missing: usize,
    pub dirty: usize,
    pub pushing: usize,
    pub pending_load: usize,
}

/// Per-layer bucket cache
pub struct Cube {
    buckets: HashMap<BucketAddress, Bucket>,
    bucket_length: usize,
    bounding_box: BoundingBox,
    max_bucket_count: usize,
    /// Edited buckets whose upstream data has not arrived yet
    pending_load: HashSet<BucketAddress>,
    pending_tx: watch::Sender<usize>,
    access_tick: u64,
}

impl Cube {
    /// Create a cube for voxels of `bytes_per_voxel` bytes
    pub fn new(bytes_per_voxel: usize, bounding_box: BoundingBox, max_bucket_count: usize) -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            buckets: HashMap::new(),
            bucket_length: BUCKET_VOXELS * bytes_per_voxel.max(1),
            bounding_box,
            max_bucket_count,
            pending_load: HashSet::new(),
            pending_tx,
            access_tick: 0,
        }
    }

    /// Bytes per bucket (`BUCKET_LENGTH`)
    pub fn bucket_length(&self) -> usize {
        self.bucket_length
    }

    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bounding_box
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Look up a bucket, creating an unrequested one on first reference
    pub fn get_or_create_bucket(&mut self, address: BucketAddress) -> &mut Bucket {
        self.access_tick += 1;
        let tick = self.access_tick;
        let length = self.bucket_length;
        let bucket = self
            .buckets
            .entry(address)
            .or_insert_with(|| Bucket::new(address, length));
        bucket.touch(tick);
        bucket
    }

    pub fn get_bucket(&self, address: &BucketAddress) -> Option<&Bucket> {
        self.buckets.get(address)
    }

    fn existing_mut(&mut self, address: &BucketAddress) -> Result<&mut Bucket> {
        self.buckets
            .get_mut(address)
            .ok_or(Error::BucketNotLoaded(*address))
    }

    /// State of a bucket; unknown addresses count as unrequested
    pub fn bucket_state(&self, address: &BucketAddress) -> BucketState {
        self.buckets
            .get(address)
            .map_or(BucketState::Unrequested, Bucket::state)
    }

    pub fn needs_request(&self, address: &BucketAddress) -> bool {
        self.buckets.get(address).is_none_or(Bucket::needs_request)
    }

    pub fn is_dirty(&self, address: &BucketAddress) -> bool {
        self.buckets.get(address).is_some_and(Bucket::is_dirty)
    }

    pub fn pull(&mut self, address: BucketAddress) -> Result<()> {
        self.get_or_create_bucket(address).pull()
    }

    /// Trim `bytes` to the dataset bounds and hand them to the bucket
    pub fn receive_data(&mut self, address: BucketAddress, mut bytes: Vec<u8>) -> Result<()> {
        if bytes.len() == self.bucket_length {
            self.bounding_box.remove_outside_area(&address, &mut bytes);
        }
        self.existing_mut(&address)?.receive_data(bytes)?;
        self.sync_pending(address);
        Ok(())
    }

    pub fn mark_missing(&mut self, address: BucketAddress) -> Result<()> {
        self.existing_mut(&address)?.mark_missing()?;
        self.sync_pending(address);
        Ok(())
    }

    /// Returns whether the bucket had a pending edit
    pub fn pull_failed(&mut self, address: BucketAddress) -> Result<bool> {
        let dirty = self.existing_mut(&address)?.pull_failed()?;
        self.sync_pending(address);
        Ok(dirty)
    }

    /// Mutate a bucket's voxels, creating the bucket if needed
    pub fn write<F>(&mut self, address: BucketAddress, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        self.get_or_create_bucket(address).write(mutate)?;
        self.sync_pending(address);
        Ok(())
    }

    pub fn get_data(&self, address: &BucketAddress) -> Result<&[u8]> {
        self.buckets
            .get(address)
            .ok_or(Error::BucketNotLoaded(*address))?
            .get_data()
    }

    /// Whether a snapshot of this bucket is still being written back
    pub fn push_in_flight(&self, address: &BucketAddress) -> bool {
        self.buckets.get(address).is_some_and(Bucket::is_push_in_flight)
    }

    pub fn start_push(&mut self, address: BucketAddress) -> Result<Vec<u8>> {
        self.existing_mut(&address)?.start_push()
    }

    pub fn push_succeeded(&mut self, address: BucketAddress) {
        if let Some(bucket) = self.buckets.get_mut(&address) {
            bucket.push_succeeded();
        }
    }

    pub fn push_failed(&mut self, address: BucketAddress) {
        if let Some(bucket) = self.buckets.get_mut(&address) {
            bucket.push_failed();
        }
    }

    /// Number of edited buckets still waiting for upstream data
    pub fn pending_load_count(&self) -> usize {
        self.pending_load.len()
    }

    /// Watch the pending load count
    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    fn sync_pending(&mut self, address: BucketAddress) {
        let pending = self
            .buckets
            .get(&address)
            .is_some_and(Bucket::has_pending_edit);
        let changed = if pending {
            self.pending_load.insert(address)
        } else {
            self.pending_load.remove(&address)
        };
        if changed {
            self.pending_tx.send_replace(self.pending_load.len());
        }
    }

    /// Evict least recently used clean buckets beyond capacity.
    ///
    /// Dirty, pushing, requested and pending-edit buckets are never evicted.
    /// Returns the number of evicted buckets.
    pub fn collect_garbage(&mut self) -> usize {
        if self.buckets.len() <= self.max_bucket_count {
            return 0;
        }

        let mut candidates: Vec<(u64, BucketAddress)> = self
            .buckets
            .values()
            .filter(|b| {
                !b.is_dirty()
                    && matches!(
                        b.state(),
                        BucketState::Unrequested | BucketState::Loaded | BucketState::Missing
                    )
            })
            .map(|b| (b.last_access(), b.address()))
            .collect();
        candidates.sort_unstable();

        let excess = self.buckets.len() - self.max_bucket_count;
        let mut evicted = 0;
        for (_, address) in candidates.into_iter().take(excess) {
            self.buckets.remove(&address);
            evicted += 1;
        }

        if evicted > 0 {
            log::debug!("Cube evicted {} buckets, {} remain", evicted, self.buckets.len());
        }
        evicted
    }

    pub fn stats(&self) -> CubeStats {
        let mut stats = CubeStats {
            total: self.buckets.len(),
            pending_load: self.pending_load.len(),
            ..Default::default()
        };
        for bucket in self.buckets.values() {
            match bucket.state() {
                BucketState::Unrequested => stats.unrequested += 1,
                BucketState::Requested => stats.requested += 1,
                BucketState::Loaded => stats.loaded += 1,
                BucketState::Missing => stats.missing += 1,
                BucketState::Dirty => stats.dirty += 1,
                BucketState::Pushing => stats.pushing += 1,
            }
        }
        stats
    }
}
