//! Bucket caching, pull and push scheduling

pub mod bounding_box;
pub mod bucket;
pub mod connection_info;
pub mod cube;
pub mod debounce;
pub mod pull_queue;
pub mod push_queue;
pub mod task_queue;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use bounding_box::BoundingBox;
pub use bucket::{Bucket, BucketAddress, BucketState, BUCKET_SIZE_P, BUCKET_VOXELS, BUCKET_WIDTH, MAX_ZOOM_STEP};
pub use connection_info::{ConnectionInfo, ConnectionStats};
pub use cube::{Cube, CubeStats};
pub use debounce::Debouncer;
pub use pull_queue::{PullQueue, PullQueueConfig, QueueEntry, PRIORITY_HIGHEST};
pub use push_queue::{PushQueue, PushQueueConfig, SaveAlert};
pub use task_queue::{AsyncTaskQueue, TaskEvent, TaskQueueConfig};

/// Lock a mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
