//! Push queue: debounced, deduplicated write-back of dirty buckets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::core::config::StreamConfig;
use crate::core::error::Result;
use crate::store::wire::{SaveQueueAction, SaveQueueItem, UpdateBucket};
use crate::store::SaveQueue;
use crate::streaming::bucket::BucketAddress;
use crate::streaming::cube::Cube;
use crate::streaming::debounce::{BoxFuture, Debouncer};
use crate::streaming::lock;
use crate::streaming::task_queue::{AsyncTaskQueue, TaskEvent, TaskQueueConfig};

#[derive(Debug, Clone)]
pub struct PushQueueConfig {
    /// Maximum buckets per save action
    pub batch_size: usize,
    pub debounce: Duration,
    /// When false the queue never touches the network
    pub send_data: bool,
    pub task: TaskQueueConfig,
}

impl Default for PushQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            debounce: Duration::from_millis(1000),
            send_data: true,
            task: TaskQueueConfig::default(),
        }
    }
}

impl From<&StreamConfig> for PushQueueConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            batch_size: config.push.batch_size.max(1),
            debounce: config.push.debounce(),
            send_data: config.push.send_data,
            task: TaskQueueConfig {
                concurrency: config.push.concurrency,
                max_retries: config.push.max_retries,
                retry_delay: config.push.retry_delay(),
            },
        }
    }
}

/// A write-back gave up; unsaved edits may be lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveAlert {
    pub message: String,
}

struct PushShared {
    cube: Arc<Mutex<Cube>>,
    save_queue: Arc<dyn SaveQueue>,
    task_queue: AsyncTaskQueue,
    config: PushQueueConfig,
    queue: Mutex<Vec<BucketAddress>>,
    debouncer: Debouncer,
    save_error: Arc<watch::Sender<bool>>,
    alerts: broadcast::Sender<SaveAlert>,
}

/// Collects dirty bucket addresses and writes them back in batches
#[derive(Clone)]
pub struct PushQueue {
    shared: Arc<PushShared>,
}

impl PushQueue {
    pub fn new(cube: Arc<Mutex<Cube>>, save_queue: Arc<dyn SaveQueue>, config: PushQueueConfig) -> Self {
        let task_queue = AsyncTaskQueue::new(config.task.clone());
        let (save_error, _) = watch::channel(false);
        let save_error = Arc::new(save_error);
        let (alerts, _) = broadcast::channel(16);

        let indicator = save_error.clone();
        task_queue.on_event(move |event| {
            let failed = matches!(event, TaskEvent::Failure { .. });
            indicator.send_if_modified(|current| {
                let changed = *current != failed;
                *current = failed;
                changed
            });
        });

        Self {
            shared: Arc::new(PushShared {
                cube,
                save_queue,
                task_queue,
                debouncer: Debouncer::new(config.debounce),
                config: PushQueueConfig {
                    batch_size: config.batch_size.max(1),
                    ..config
                },
                queue: Mutex::new(Vec::new()),
                save_error,
                alerts,
            }),
        }
    }

    pub fn config(&self) -> &PushQueueConfig {
        &self.shared.config
    }

    /// Queue a dirty bucket and restart the debounce window.
    ///
    /// Must be called from within a tokio runtime.
    pub fn insert(&self, address: BucketAddress) {
        {
            let mut queue = lock(&self.shared.queue);
            queue.push(address);
            queue.sort_unstable();
            queue.dedup();
        }

        let this = self.clone();
        self.shared.debouncer.call(move || -> BoxFuture {
            Box::pin(async move {
                // Failures are reported through alerts and the indicator
                let _ = this.push_impl().await;
            })
        });
    }

    /// Addresses waiting for the next push, sorted and unique
    pub fn pending(&self) -> Vec<BucketAddress> {
        lock(&self.shared.queue).clone()
    }

    /// Drop everything not yet handed to the task queue
    pub fn clear(&self) {
        self.shared.debouncer.cancel();
        lock(&self.shared.queue).clear();
    }

    /// Skip the debounce window and push now
    pub async fn push_now(&self) -> Result<()> {
        self.shared.debouncer.cancel();
        self.push_impl().await
    }

    /// Everything is durably saved: nothing queued, no edited bucket still
    /// loading, no write in flight
    pub fn state_saved(&self) -> bool {
        lock(&self.shared.queue).is_empty()
            && lock(&self.shared.cube).pending_load_count() == 0
            && !self.shared.task_queue.is_busy()
    }

    /// Persistent "save error" indicator, cleared by the next successful push
    pub fn save_error(&self) -> bool {
        *self.shared.save_error.borrow()
    }

    pub fn subscribe_save_error(&self) -> watch::Receiver<bool> {
        self.shared.save_error.subscribe()
    }

    /// Fatal write-back failures
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<SaveAlert> {
        self.shared.alerts.subscribe()
    }

    async fn push_impl(&self) -> Result<()> {
        let shared = &self.shared;

        // Edits on buckets without upstream data cannot be serialized yet
        let mut pending_rx = lock(&shared.cube).subscribe_pending();
        let _ = pending_rx.wait_for(|count| *count == 0).await;

        if !shared.config.send_data {
            log::debug!("Sending data is disabled, keeping {} buckets queued", self.pending().len());
            return Ok(());
        }

        loop {
            let batch: Vec<BucketAddress> = {
                let mut queue = lock(&shared.queue);
                if queue.is_empty() {
                    break;
                }
                let count = shared.config.batch_size.min(queue.len());
                queue.drain(..count).collect()
            };

            let this = self.clone();
            shared.task_queue.schedule_task(move || {
                let this = this.clone();
                let batch = batch.clone();
                async move { this.push_batch(&batch).await }
            });
        }

        if let Err(e) = shared.task_queue.join().await {
            log::error!("Saving failed, unsaved changes may be lost: {}", e);
            shared.save_error.send_replace(true);
            let _ = shared.alerts.send(SaveAlert {
                message: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    async fn push_batch(&self, batch: &[BucketAddress]) -> Result<()> {
        let shared = &self.shared;

        let (addresses, items, deferred) = {
            let mut cube = lock(&shared.cube);
            let mut addresses = Vec::with_capacity(batch.len());
            let mut items = Vec::with_capacity(batch.len());
            let mut deferred = Vec::new();
            for &address in batch {
                if cube.push_in_flight(&address) {
                    deferred.push(address);
                    continue;
                }
                match cube.start_push(address) {
                    Ok(data) => {
                        items.push(SaveQueueItem::UpdateBucket(UpdateBucket::new(&address, &data)));
                        addresses.push(address);
                    }
                    // Already pushed or never edited
                    Err(e) => log::trace!("Not pushing {}: {}", address, e),
                }
            }
            (addresses, items, deferred)
        };
        // Pushed again once the outstanding snapshot settles
        for address in deferred {
            log::trace!("Deferring {} until its previous push settles", address);
            self.insert(address);
        }
        if items.is_empty() {
            return Ok(());
        }

        log::debug!("Pushing {} buckets", items.len());
        let result = shared
            .save_queue
            .push_save_queue(SaveQueueAction::PushSaveQueue { items })
            .await;

        let mut cube = lock(&shared.cube);
        for &address in &addresses {
            if result.is_ok() {
                cube.push_succeeded(address);
            } else {
                cube.push_failed(address);
            }
        }
        result
    }
}
