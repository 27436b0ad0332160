//! Bucket: one cube-aligned chunk of volume data and its load/save state machine.
//!
//! ```text
//! UNREQUESTED --pull--> REQUESTED --receive_data--> LOADED --write--> DIRTY
//!      ^                    |   \--mark_missing--> MISSING --write--> DIRTY
//!      +----pull_failed-----+                                         |
//!                              LOADED <--push_succeeded-- PUSHING <--start_push
//! ```
//!
//! Writes to a bucket that has not been resolved yet land in a zeroed overlay
//! and keep the bucket in its current load state with the dirty flag set. The
//! overlay wins over whatever the store sends later.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// log2 of the bucket edge length
pub const BUCKET_SIZE_P: u32 = 5;
/// Voxels along one bucket edge
pub const BUCKET_WIDTH: usize = 1 << BUCKET_SIZE_P;
/// Voxels in one bucket
pub const BUCKET_VOXELS: usize = BUCKET_WIDTH * BUCKET_WIDTH * BUCKET_WIDTH;
/// Coarsest zoom step whose voxel positions still fit an `i32` shift
pub const MAX_ZOOM_STEP: u32 = 31 - BUCKET_SIZE_P;

/// Address of a bucket: cube-aligned position plus resolution level.
///
/// Ordering is lexicographic on x, y, z, then zoom step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketAddress {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub zoom_step: u32,
}

impl BucketAddress {
    pub fn new(x: i32, y: i32, z: i32, zoom_step: u32) -> Self {
        Self { x, y, z, zoom_step }
    }

    /// Bits from bucket to finest voxel coordinates. Zoom steps beyond
    /// `MAX_ZOOM_STEP` are clamped.
    pub fn zoom_shift(&self) -> u32 {
        BUCKET_SIZE_P + self.zoom_step.min(MAX_ZOOM_STEP)
    }

    pub fn has_valid_zoom(&self) -> bool {
        self.zoom_step <= MAX_ZOOM_STEP
    }

    /// Position of the bucket's first voxel in finest-resolution coordinates
    pub fn top_left_voxel(&self) -> [i32; 3] {
        let shift = self.zoom_shift();
        [self.x << shift, self.y << shift, self.z << shift]
    }

    pub fn to_array(&self) -> [i32; 4] {
        [self.x, self.y, self.z, self.zoom_step as i32]
    }
}

impl From<[i32; 4]> for BucketAddress {
    fn from([x, y, z, zoom_step]: [i32; 4]) -> Self {
        Self::new(x, y, z, zoom_step.max(0) as u32)
    }
}

impl fmt::Display for BucketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.x, self.y, self.z, self.zoom_step)
    }
}

/// Load/save state of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketState {
    Unrequested,
    /// Fetch in flight
    Requested,
    /// Clean, data present
    Loaded,
    /// Confirmed absent upstream
    Missing,
    /// Locally modified, not yet pushed
    Dirty,
    /// Write-back in flight
    Pushing,
}

/// A single cached chunk of volume data
#[derive(Debug)]
pub struct Bucket {
    address: BucketAddress,
    bucket_length: usize,
    state: BucketState,
    data: Option<Vec<u8>>,
    dirty: bool,
    /// A snapshot of this bucket is being written back
    push_in_flight: bool,
    last_access: u64,
}

impl Bucket {
    /// Create an unrequested bucket holding `bucket_length` bytes once loaded
    pub fn new(address: BucketAddress, bucket_length: usize) -> Self {
        Self {
            address,
            bucket_length,
            state: BucketState::Unrequested,
            data: None,
            dirty: false,
            push_in_flight: false,
            last_access: 0,
        }
    }

    pub fn address(&self) -> BucketAddress {
        self.address
    }

    pub fn state(&self) -> BucketState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn bucket_length(&self) -> usize {
        self.bucket_length
    }

    pub fn is_push_in_flight(&self) -> bool {
        self.push_in_flight
    }

    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub(crate) fn touch(&mut self, tick: u64) {
        self.last_access = tick;
    }

    /// True if a fetch should be issued for this bucket
    pub fn needs_request(&self) -> bool {
        self.state == BucketState::Unrequested
    }

    /// Locally edited before its upstream data has arrived
    pub fn has_pending_edit(&self) -> bool {
        self.dirty && matches!(self.state, BucketState::Unrequested | BucketState::Requested)
    }

    /// Fully resolved: loaded or known to be missing, edited or not
    pub fn is_resolved(&self) -> bool {
        !matches!(self.state, BucketState::Unrequested | BucketState::Requested)
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidTransition {
            address: self.address,
            state: self.state,
            action,
        }
    }

    /// Mark the bucket as requested; issuing the fetch is the caller's job
    pub fn pull(&mut self) -> Result<()> {
        if self.state != BucketState::Unrequested {
            return Err(self.invalid("pull"));
        }
        self.state = BucketState::Requested;
        Ok(())
    }

    /// Store fetched bytes.
    ///
    /// A clean bucket becomes `Loaded`. A bucket with a pending edit keeps its
    /// non-zero voxels, takes the received ones elsewhere and becomes `Dirty`.
    pub fn receive_data(&mut self, bytes: Vec<u8>) -> Result<()> {
        if self.state != BucketState::Requested {
            return Err(self.invalid("receive data"));
        }
        if bytes.len() != self.bucket_length {
            return Err(Error::MalformedBucketData {
                expected: self.bucket_length,
                actual: bytes.len(),
            });
        }

        let voxel_size = (self.bucket_length / BUCKET_VOXELS).max(1);
        match self.data.as_mut() {
            Some(overlay) if self.dirty => {
                for (local, received) in overlay
                    .chunks_mut(voxel_size)
                    .zip(bytes.chunks(voxel_size))
                {
                    if local.iter().all(|&b| b == 0) {
                        local.copy_from_slice(received);
                    }
                }
                self.state = BucketState::Dirty;
            }
            _ => {
                self.data = Some(bytes);
                self.dirty = false;
                self.state = BucketState::Loaded;
            }
        }
        log::trace!("Bucket {} -> {:?}", self.address, self.state);
        Ok(())
    }

    /// The store confirmed there is no data for this bucket
    pub fn mark_missing(&mut self) -> Result<()> {
        if self.state != BucketState::Requested {
            return Err(self.invalid("mark missing"));
        }
        self.state = if self.dirty {
            BucketState::Dirty
        } else {
            BucketState::Missing
        };
        Ok(())
    }

    /// Fetch failed: back to `Unrequested`.
    ///
    /// Returns whether the bucket carries a pending edit, in which case the
    /// caller must re-queue it at the highest priority.
    pub fn pull_failed(&mut self) -> Result<bool> {
        if self.state != BucketState::Requested {
            return Err(self.invalid("fail pull"));
        }
        self.state = BucketState::Unrequested;
        Ok(self.dirty)
    }

    /// Mutate the voxel buffer in place, marking the bucket dirty
    pub fn write<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let length = self.bucket_length;
        let data = self.data.get_or_insert_with(|| vec![0; length]);
        mutate(data);
        self.dirty = true;

        match self.state {
            BucketState::Unrequested | BucketState::Requested => {}
            BucketState::Loaded | BucketState::Missing | BucketState::Dirty | BucketState::Pushing => {
                self.state = BucketState::Dirty;
            }
        }
        Ok(())
    }

    /// Raw voxel bytes, available once data is present upstream or local
    pub fn get_data(&self) -> Result<&[u8]> {
        match (self.state, self.data.as_deref()) {
            (BucketState::Loaded | BucketState::Dirty | BucketState::Pushing, Some(data)) => Ok(data),
            _ => Err(Error::BucketNotLoaded(self.address)),
        }
    }

    /// `Dirty -> Pushing`, returning a snapshot of the bytes to send.
    ///
    /// At most one snapshot is in flight: a bucket edited again while its
    /// previous push is outstanding is refused until that push settles.
    pub fn start_push(&mut self) -> Result<Vec<u8>> {
        if self.push_in_flight {
            return Err(self.invalid("push while a push is in flight"));
        }
        if self.state != BucketState::Dirty {
            return Err(self.invalid("push"));
        }
        let snapshot = self.get_data()?.to_vec();
        self.state = BucketState::Pushing;
        self.push_in_flight = true;
        Ok(snapshot)
    }

    /// Write-back confirmed. A bucket edited again during the push stays dirty.
    pub fn push_succeeded(&mut self) {
        if !std::mem::take(&mut self.push_in_flight) {
            return;
        }
        if self.state == BucketState::Pushing {
            self.state = BucketState::Loaded;
            self.dirty = false;
        }
    }

    pub fn push_failed(&mut self) {
        if !std::mem::take(&mut self.push_in_flight) {
            return;
        }
        if self.state == BucketState::Pushing {
            self.state = BucketState::Dirty;
        }
    }
}
