//! Bounded-concurrency async task runner with retries and join semantics

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::core::error::{Error, Result};

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
type Task = Box<dyn FnMut() -> TaskFuture + Send + 'static>;
type Listener = Box<dyn Fn(&TaskEvent) + Send + Sync + 'static>;

/// Outcome of the most recent task attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Success,
    Failure { retry_count: u32 },
}

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Tasks running at once
    pub concurrency: usize,
    /// Retries per task before the queue gives up
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    running: usize,
    /// First permanent failure of the current busy period
    failure: Option<String>,
}

/// Published on every transition. An idle status carries the first failure
/// of the busy period it ends, so every joiner of that period sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum QueueStatus {
    Busy,
    Idle { failure: Option<String> },
}

struct Shared {
    config: TaskQueueConfig,
    state: Mutex<QueueState>,
    status_tx: watch::Sender<QueueStatus>,
    listeners: Mutex<Vec<Listener>>,
}

impl Shared {
    fn emit(&self, event: TaskEvent) {
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter() {
                listener(&event);
            }
        }
    }
}

/// Runs zero-argument async closures with a concurrency limit.
///
/// A failing task is retried up to `max_retries` times. Once a task exhausts
/// its retries the remaining queued tasks are dropped and the next `join`
/// reports the failure.
#[derive(Clone)]
pub struct AsyncTaskQueue {
    shared: Arc<Shared>,
}

impl AsyncTaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        let (status_tx, _) = watch::channel(QueueStatus::Idle { failure: None });
        Self {
            shared: Arc::new(Shared {
                config: TaskQueueConfig {
                    concurrency: config.concurrency.max(1),
                    ..config
                },
                state: Mutex::new(QueueState::default()),
                status_tx,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a callback for success/failure events
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.shared.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    /// Enqueue a task and start it right away if under the limit.
    ///
    /// The closure is called again for each retry. Must be called from within
    /// a tokio runtime.
    pub fn schedule_task<F, Fut>(&self, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: Task = Box::new(move || -> TaskFuture { Box::pin(task()) });
        if let Ok(mut state) = self.shared.state.lock() {
            state.pending.push_back(boxed);
        }
        start_next(&self.shared);
    }

    /// Any task running or queued
    pub fn is_busy(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.running > 0 || !state.pending.is_empty())
            .unwrap_or(false)
    }

    /// Number of tasks running or queued
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| state.running + state.pending.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every scheduled task, including ones scheduled meanwhile,
    /// has completed. Fails if a task of this busy period exhausted its
    /// retries; every concurrent joiner gets the same failure. Joining an
    /// idle queue succeeds immediately.
    pub async fn join(&self) -> Result<()> {
        let mut status_rx = self.shared.status_tx.subscribe();
        if *status_rx.borrow_and_update() != QueueStatus::Busy {
            return Ok(());
        }

        // The sender lives in `shared`, so the channel cannot close under us
        let failure = match status_rx
            .wait_for(|status| matches!(status, QueueStatus::Idle { .. }))
            .await
        {
            Ok(status) => match &*status {
                QueueStatus::Idle { failure } => failure.clone(),
                QueueStatus::Busy => None,
            },
            Err(_) => None,
        };
        match failure {
            Some(message) => Err(Error::PermanentPushFailure(message)),
            None => Ok(()),
        }
    }
}

fn start_next(shared: &Arc<Shared>) {
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    while state.running < shared.config.concurrency {
        let Some(task) = state.pending.pop_front() else {
            break;
        };
        state.running += 1;
        tokio::spawn(run_task(shared.clone(), task));
    }
    let status = if state.running > 0 || !state.pending.is_empty() {
        QueueStatus::Busy
    } else {
        QueueStatus::Idle {
            failure: state.failure.take(),
        }
    };
    shared.status_tx.send_replace(status);
}

async fn run_task(shared: Arc<Shared>, mut task: Task) {
    let mut retry_count = 0;
    let outcome = loop {
        match task().await {
            Ok(()) => break Ok(()),
            Err(e) => {
                retry_count += 1;
                log::warn!("Task failed (attempt {}): {}", retry_count, e);
                shared.emit(TaskEvent::Failure { retry_count });
                if retry_count > shared.config.max_retries {
                    break Err(e);
                }
                tokio::time::sleep(shared.config.retry_delay).await;
            }
        }
    };

    let succeeded = outcome.is_ok();
    if let Ok(mut state) = shared.state.lock() {
        state.running -= 1;
        if let Err(e) = outcome {
            let dropped = state.pending.len();
            state.pending.clear();
            log::error!(
                "Task gave up after {} attempts, dropping {} queued tasks: {}",
                retry_count,
                dropped,
                e
            );
            state.failure.get_or_insert_with(|| e.to_string());
        }
    }
    if succeeded {
        shared.emit(TaskEvent::Success);
    }
    start_next(&shared);
}
