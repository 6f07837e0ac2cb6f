//! Change notification bus
//!
//! The metadata service is the only publisher. Observers subscribe
//! independently of the write path and each gets its own receiver.

use common::Entry;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Lifecycle event of one entry
#[derive(Debug, Clone, PartialEq)]
pub enum EntryEvent {
    Created(Entry),
    Changed { new: Entry, old: Entry },
    Deleted(Entry),
}

impl EntryEvent {
    /// The entry as it is after the event (as it was, for deletions)
    pub fn entry(&self) -> &Entry {
        match self {
            EntryEvent::Created(entry) | EntryEvent::Deleted(entry) => entry,
            EntryEvent::Changed { new, .. } => new,
        }
    }

    pub fn previous(&self) -> Option<&Entry> {
        match self {
            EntryEvent::Changed { old, .. } => Some(old),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntryEvent::Created(_) => "created",
            EntryEvent::Changed { .. } => "changed",
            EntryEvent::Deleted(_) => "deleted",
        }
    }
}

#[derive(Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<EntryEvent>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntryEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, event: EntryEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}
