//! In-memory doubles for the network boundary

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::core::error::{Error, Result, TransportError};
use crate::store::wire::SaveQueueAction;
use crate::store::{BinaryResponse, BucketSource, SaveQueue, StoreResponse, Transport};
use crate::streaming::bucket::BucketAddress;

/// Scripted HTTP transport
pub(crate) struct MockTransport {
    tokens: Mutex<VecDeque<String>>,
    responses: Mutex<VecDeque<std::result::Result<Vec<u8>, TransportError>>>,
    binary_calls: Mutex<Vec<(String, Value)>>,
    json_calls: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    /// Tokens are handed out in order, the last one repeating
    pub fn new(tokens: Vec<&str>) -> Self {
        Self {
            tokens: Mutex::new(tokens.into_iter().map(String::from).collect()),
            responses: Mutex::new(VecDeque::new()),
            binary_calls: Mutex::new(Vec::new()),
            json_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond_with(&self, response: std::result::Result<Vec<u8>, TransportError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn binary_calls(&self) -> Vec<(String, Value)> {
        self.binary_calls.lock().unwrap().clone()
    }

    pub fn json_calls(&self) -> Vec<(String, Value)> {
        self.json_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_json_receive_arraybuffer(
        &self,
        url: &str,
        body: &Value,
    ) -> std::result::Result<BinaryResponse, TransportError> {
        self.binary_calls.lock().unwrap().push((url.to_string(), body.clone()));
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no response scripted".into())));
        response.map(|body| BinaryResponse {
            body,
            missing_buckets: Vec::new(),
        })
    }

    async fn send_json(&self, url: &str, body: &Value) -> std::result::Result<(), TransportError> {
        self.json_calls.lock().unwrap().push((url.to_string(), body.clone()));
        Ok(())
    }

    async fn receive_json(&self, _url: &str) -> std::result::Result<Value, TransportError> {
        let mut tokens = self.tokens.lock().unwrap();
        let token = if tokens.len() > 1 {
            tokens.pop_front()
        } else {
            tokens.front().cloned()
        };
        Ok(json!({ "token": token.unwrap_or_default() }))
    }
}

/// Bucket source answering with constant-filled buckets unless scripted
/// otherwise. A gated source holds every request until `open` is called.
pub(crate) struct MockSource {
    bucket_length: usize,
    fill: u8,
    scripted: Mutex<VecDeque<Result<StoreResponse>>>,
    calls: Mutex<Vec<Vec<BucketAddress>>>,
    gate: Option<Semaphore>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockSource {
    pub fn new(bucket_length: usize, fill: u8) -> Self {
        Self {
            bucket_length,
            fill,
            scripted: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn gated(bucket_length: usize, fill: u8) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(bucket_length, fill)
        }
    }

    pub fn open(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1_000);
        }
    }

    pub fn script(&self, result: Result<StoreResponse>) {
        self.scripted.lock().unwrap().push_back(result);
    }

    pub fn fail_next(&self) {
        self.script(Err(Error::Fetch(TransportError::Status(503))));
    }

    pub fn calls(&self) -> Vec<Vec<BucketAddress>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BucketSource for MockSource {
    async fn request_from_store(&self, batch: &[BucketAddress]) -> Result<StoreResponse> {
        self.calls.lock().unwrap().push(batch.to_vec());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.scripted.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(StoreResponse {
                data: vec![self.fill; self.bucket_length * batch.len()],
                missing: Vec::new(),
            })
        })
    }
}

/// Records pushed actions; can be told to fail the next few pushes
#[derive(Default)]
pub(crate) struct MockSaveQueue {
    actions: Mutex<Vec<SaveQueueAction>>,
    failures_left: AtomicUsize,
    /// Per-call latency and outcome, consumed in call order
    script: Mutex<VecDeque<(Duration, bool)>>,
}

impl MockSaveQueue {
    /// Calls past the end of the script succeed immediately
    pub fn script(&self, calls: Vec<(Duration, bool)>) {
        *self.script.lock().unwrap() = calls.into();
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn actions(&self) -> Vec<SaveQueueAction> {
        self.actions.lock().unwrap().clone()
    }

    /// Pushed addresses per action, decoded from positions
    pub fn pushed_positions(&self) -> Vec<Vec<([i32; 3], u32)>> {
        self.actions()
            .iter()
            .map(|action| {
                action
                    .items()
                    .iter()
                    .map(|item| match item {
                        crate::store::wire::SaveQueueItem::UpdateBucket(update) => {
                            (update.position, update.zoom_step)
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl SaveQueue for MockSaveQueue {
    async fn push_save_queue(&self, action: SaveQueueAction) -> Result<()> {
        let scripted = self.script.lock().unwrap().pop_front();
        let mut failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if let Some((delay, succeed)) = scripted {
            tokio::time::sleep(delay).await;
            failing |= !succeed;
        }
        if failing {
            return Err(Error::Fetch(TransportError::Status(500)));
        }
        self.actions.lock().unwrap().push(action);
        Ok(())
    }
}
