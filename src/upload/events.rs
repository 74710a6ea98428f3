//! Completion notifications

use tokio::sync::broadcast;

use super::types::UploadComplete;

/// Capacity of the broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Receives a notification for every completed, verified upload
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn emit(&self, event: UploadComplete);
}

/// Logs completed uploads
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn emit(&self, event: UploadComplete) {
        tracing::info!(
            key = %event.key,
            location = %event.location,
            storage_path = %event.storage_path,
            size = event.size,
            metadata_entries = event.metadata.len(),
            "Upload complete"
        );
    }
}

/// Fans completed uploads out to any number of subscribers
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<UploadComplete>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadComplete> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[async_trait::async_trait]
impl Notifier for BroadcastNotifier {
    async fn emit(&self, event: UploadComplete) {
        let key = event.key.clone();
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            tracing::debug!(key = %key, "No subscribers for upload completion");
        }
    }
}
