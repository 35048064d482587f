use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-company broadcast of committed events. The mail collaborator
/// subscribes here; slow subscribers lag rather than block commits.
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

    /// Subscribe to a company's events, creating its channel on first use.
    pub fn subscribe(&self, company_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(company_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fan an event out to its company's subscribers. No-op without any.
    pub fn publish(&self, event: &Event) {
        let company_id = event.company_id();
        let Some(sender) = self.channels.get(&company_id) else {
            return;
        };
        if sender.send(event.clone()).is_err() {
            // Last receiver went away.
            drop(sender);
            self.channels
                .remove_if(&company_id, |_, s| s.receiver_count() == 0);
        }
    }
}
