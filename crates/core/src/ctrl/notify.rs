use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::DEFAULT_RECONNECT_QUEUE_LEN;

/// Emitted after every successful bind of a control channel underlay, whether it was
/// the first member or a replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectEvent {
    pub address: String,
    pub logical_name: String,
    pub members: usize,
}

/// Fans reconnect events out to subscribers without ever waiting on them.
///
/// Each subscriber owns a bounded queue; when it is full the event is dropped for that
/// subscriber only, and subscribers whose receiver was dropped are forgotten.
pub struct ReconnectNotifier {
    subscribers: Mutex<Vec<mpsc::Sender<ReconnectEvent>>>,
    queue_len: usize,
}

impl Default for ReconnectNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_QUEUE_LEN)
    }
}

impl ReconnectNotifier {
    pub fn new(queue_len: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            queue_len: queue_len.max(1),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ReconnectEvent> {
        let (tx, rx) = mpsc::channel(self.queue_len);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Returns the number of subscribers the event was queued for.
    pub fn notify(&self, event: ReconnectEvent) -> usize {
        let mut delivered = 0;
        self.subscribers.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    address = %event.address,
                    channel = %event.logical_name,
                    "Reconnect subscriber lagging, dropping notification"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        tracing::debug!(
            address = %event.address,
            channel = %event.logical_name,
            members = event.members,
            delivered,
            "Reconnect notification sent"
        );
        delivered
    }
}
