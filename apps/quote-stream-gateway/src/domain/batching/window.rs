//! Batch Buffer
//!
//! Count-capped buffer for inbound events. The collector owns exactly one
//! active buffer; time-based flushing is driven by the collector's timer.

use crate::domain::streaming::{FeedKey, QuoteEvent};

/// Result of pushing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Event buffered; room remains.
    Buffered,
    /// Event buffered and the count cap is reached; flush now.
    Full,
}

/// Count-capped event buffer.
#[derive(Debug)]
pub struct BatchBuffer {
    events: Vec<QuoteEvent>,
    max_events: usize,
}

impl BatchBuffer {
    /// Create an empty buffer holding at most `max_events`.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        let max_events = max_events.max(1);
        Self {
            events: Vec::with_capacity(max_events),
            max_events,
        }
    }

    /// Append an event.
    pub fn push(&mut self, event: QuoteEvent) -> PushOutcome {
        self.events.push(event);

        if self.events.len() >= self.max_events {
            PushOutcome::Full
        } else {
            PushOutcome::Buffered
        }
    }

    /// Buffered event count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drain buffered events into a batch, leaving the buffer empty.
    pub fn take(&mut self, id: u64) -> Option<Batch> {
        if self.events.is_empty() {
            return None;
        }
        let events = std::mem::replace(&mut self.events, Vec::with_capacity(self.max_events));
        Some(Batch::new(id, events))
    }

    /// Install `next` as the active buffer and return whatever the old
    /// one still held.
    pub fn swap(&mut self, next: Self) -> Vec<QuoteEvent> {
        std::mem::replace(self, next).events
    }
}

/// A flushed group of events.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Monotonic batch id.
    pub id: u64,
    /// Events in arrival order.
    pub events: Vec<QuoteEvent>,
}

impl Batch {
    /// Create a batch.
    #[must_use]
    pub const fn new(id: u64, events: Vec<QuoteEvent>) -> Self {
        Self { id, events }
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch has no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Split by (provider, capability), keeping first-seen feed order and
    /// arrival order within each feed.
    #[must_use]
    pub fn group_by_feed(self) -> Vec<FeedGroup> {
        let mut groups: Vec<FeedGroup> = Vec::new();
        for event in self.events {
            let feed = event.feed();
            match groups.iter_mut().find(|g| g.feed == feed) {
                Some(group) => group.events.push(event),
                None => groups.push(FeedGroup {
                    feed,
                    events: vec![event],
                }),
            }
        }
        groups
    }
}

/// Events of one batch that share a feed.
#[derive(Debug, Clone)]
pub struct FeedGroup {
    /// The shared feed.
    pub feed: FeedKey,
    /// Events in arrival order.
    pub events: Vec<QuoteEvent>,
}
