use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info};

/// In-process fan-out of JSON frames to every live subscription.
#[derive(Debug, Clone)]
pub struct RealtimeHub {
    tx: Arc<Mutex<broadcast::Sender<Arc<str>>>>,
    capacity: usize,
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx: Arc::new(Mutex::new(tx)),
            capacity,
        }
    }

    /// Sends a frame, returning how many subscriptions it reached.
    pub fn publish(&self, frame: Arc<str>) -> usize {
        match self.sender().send(frame) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No realtime subscribers, frame dropped");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.sender().subscribe()
    }

    /// Closes every live subscription abnormally, as a server restart would.
    pub fn restart(&self) {
        let (tx, _) = broadcast::channel(self.capacity);
        *self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = tx;
        info!("Realtime hub restarted, all subscriptions dropped");
    }

    fn sender(&self) -> broadcast::Sender<Arc<str>> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
