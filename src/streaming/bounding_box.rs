//! Dataset bounding box used to discard voxels outside the valid volume

use serde::{Deserialize, Serialize};

use crate::streaming::bucket::{BucketAddress, BUCKET_SIZE_P, BUCKET_VOXELS, BUCKET_WIDTH};

/// Axis-aligned box in finest-resolution voxel coordinates, max exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [i32; 3],
    pub max: [i32; 3],
}

impl BoundingBox {
    pub fn new(min: [i32; 3], max: [i32; 3]) -> Self {
        Self { min, max }
    }

    /// Extent covered by a bucket, as (min, max exclusive). Widened to `i64`
    /// so coarse zoom steps cannot overflow.
    fn bucket_extent(address: &BucketAddress) -> ([i64; 3], [i64; 3]) {
        let shift = address.zoom_shift();
        let min = [address.x, address.y, address.z].map(|c| (c as i64) << shift);
        let size = 1i64 << shift;
        (min, min.map(|c| c + size))
    }

    pub fn contains_full_bucket(&self, address: &BucketAddress) -> bool {
        let (lo, hi) = Self::bucket_extent(address);
        (0..3).all(|i| lo[i] >= self.min[i] as i64 && hi[i] <= self.max[i] as i64)
    }

    pub fn intersects_bucket(&self, address: &BucketAddress) -> bool {
        let (lo, hi) = Self::bucket_extent(address);
        (0..3).all(|i| lo[i] < self.max[i] as i64 && hi[i] > self.min[i] as i64)
    }

    /// Zero every voxel of `data` lying outside the box.
    ///
    /// Voxels are laid out x fastest, then y, then z.
    pub fn remove_outside_area(&self, address: &BucketAddress, data: &mut [u8]) {
        if self.contains_full_bucket(address) {
            return;
        }

        let voxel_size = (data.len() / BUCKET_VOXELS).max(1);
        let (base, _) = Self::bucket_extent(address);
        let zoom = address.zoom_shift() - BUCKET_SIZE_P;
        let inside = |axis: usize, offset: usize| {
            let coord = base[axis] + ((offset as i64) << zoom);
            coord >= self.min[axis] as i64 && coord < self.max[axis] as i64
        };

        for dz in 0..BUCKET_WIDTH {
            let z_inside = inside(2, dz);
            for dy in 0..BUCKET_WIDTH {
                let y_inside = inside(1, dy);
                for dx in 0..BUCKET_WIDTH {
                    if z_inside && y_inside && inside(0, dx) {
                        continue;
                    }
                    let index = ((dz * BUCKET_WIDTH + dy) * BUCKET_WIDTH + dx) * voxel_size;
                    if let Some(voxel) = data.get_mut(index..index + voxel_size) {
                        voxel.fill(0);
                    }
                }
            }
        }
    }
}
