//! Per-session live event channels. Durability comes from the store's event
//! log, not from these channels; a subscriber that lags or reconnects
//! replays from the store and only uses the channel for what happens next.

use hashbrown::HashMap;
use log::debug;
use menulens_db::types::EventRow;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<EventRow>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribes to a session's live events, creating the channel on first
    /// use. Safe to call before the session exists.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Arc<EventRow>> {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Best-effort live delivery. A session with no channel (nobody ever
    /// subscribed, or it was retired) is a no-op; slow subscribers that
    /// overflow the channel see `Lagged` and recover via store replay.
    pub fn publish(&self, event: Arc<EventRow>) {
        let sender = {
            let channels = self.channels.lock().expect("event bus lock poisoned");
            channels.get(&event.session_id).cloned()
        };
        if let Some(sender) = sender {
            // Err here just means there are currently no receivers.
            let _ = sender.send(event);
        }
    }

    /// Drops a terminal session's channel. Attached receivers drain what was
    /// already sent, then see `Closed`.
    pub fn retire(&self, session_id: &str) {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        if channels.remove(session_id).is_some() {
            debug!("Retired event channel for session {session_id}");
        }
    }
}
