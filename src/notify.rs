use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-course broadcast of committed events. Calendar views subscribe to a
/// course and refetch when something lands.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, course_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(course_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, course_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&course_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Deliver to every subscribed course (global rule changes).
    pub fn send_all(&self, event: &Event) {
        for sender in self.channels.iter() {
            let _ = sender.value().send(event.clone());
        }
    }

    pub fn remove(&self, course_id: &Ulid) {
        self.channels.remove(course_id);
    }
}
