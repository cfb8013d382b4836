//! Event staging for one transaction.
//!
//! The builder holds two queues: the batch of events committed with the
//! current transaction, and the buffer of externally-originated events that
//! arrived while a decision task was in flight. Buffered payloads have no
//! event id until they are flushed — ids are allocated at flush time so the
//! history stays strictly ordered.

use crate::{EventKind, HistoryEvent};

#[derive(Debug, Clone, Default)]
pub struct HistoryBuilder {
    batch: Vec<HistoryEvent>,
    buffered: Vec<EventKind>,
}

impl HistoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: HistoryEvent) {
        self.batch.push(event);
    }

    pub fn buffer(&mut self, kind: EventKind) {
        self.buffered.push(kind);
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffered.is_empty()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    /// Take the buffer for flushing; the caller assigns ids and re-pushes.
    pub fn drain_buffered(&mut self) -> Vec<EventKind> {
        std::mem::take(&mut self.buffered)
    }

    pub fn batch(&self) -> &[HistoryEvent] {
        &self.batch
    }

    pub fn drain_batch(&mut self) -> Vec<HistoryEvent> {
        std::mem::take(&mut self.batch)
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty() && self.buffered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_clears_both_queues_independently() {
        let mut builder = HistoryBuilder::new();
        builder.push(HistoryEvent::new(1, EventKind::WorkflowExecutionTimedOut));
        builder.buffer(EventKind::WorkflowExecutionSignaled {
            signal_name: "s".into(),
            input: String::new(),
            identity: String::new(),
        });

        assert!(builder.has_buffered());
        assert_eq!(builder.drain_buffered().len(), 1);
        assert!(!builder.has_buffered());

        assert_eq!(builder.drain_batch().len(), 1);
        assert!(builder.is_empty());
    }
}
