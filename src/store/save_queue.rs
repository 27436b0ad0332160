//! Save queue sinks for push batches

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::error::{Error, Result};
use crate::store::token::TokenProvider;
use crate::store::wire::SaveQueueAction;
use crate::store::{SaveQueue, Transport};

/// Hands actions to the host application over a channel, which owns the
/// actual persistence
pub struct ChannelSaveQueue {
    tx: mpsc::UnboundedSender<SaveQueueAction>,
}

impl ChannelSaveQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SaveQueueAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SaveQueue for ChannelSaveQueue {
    async fn push_save_queue(&self, action: SaveQueueAction) -> Result<()> {
        self.tx
            .send(action)
            .map_err(|_| Error::PermanentPushFailure("save queue receiver dropped".into()))
    }
}

/// POSTs each action as JSON to the save endpoint
pub struct HttpSaveQueue {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenProvider>,
    save_url: String,
}

impl HttpSaveQueue {
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<TokenProvider>, save_url: impl Into<String>) -> Self {
        Self {
            transport,
            tokens,
            save_url: save_url.into(),
        }
    }
}

#[async_trait]
impl SaveQueue for HttpSaveQueue {
    async fn push_save_queue(&self, action: SaveQueueAction) -> Result<()> {
        let body = serde_json::to_value(&action)?;
        self.tokens
            .do_with_token(|token| {
                let url = format!("{}?token={}", self.save_url, token);
                let body = &body;
                async move { self.transport.send_json(&url, body).await }
            })
            .await
    }
}
