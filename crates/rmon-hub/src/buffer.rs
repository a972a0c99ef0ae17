use rmon_core::{EventKind, MonitorEvent};
use std::collections::VecDeque;

pub const EVENT_BUFFER_CAPACITY: usize = 500;

/// Bounded recent-event window for one loop. Oldest events are evicted first.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: VecDeque<MonitorEvent>,
    capacity: usize,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::with_capacity(EVENT_BUFFER_CAPACITY)
    }
}

impl EventBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(EVENT_BUFFER_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Stores an event. A paired event takes the slot of the call it resolves
    /// when that call is still buffered.
    pub fn record(&mut self, event: MonitorEvent) {
        if matches!(event.kind, EventKind::ToolPaired(_)) {
            if let Some(slot) = self.events.iter_mut().rev().find(|buffered| {
                buffered.id == event.id && matches!(buffered.kind, EventKind::ToolCall(_))
            }) {
                *slot = event;
                return;
            }
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Up to `count` most recent events, oldest first.
    pub fn recent(&self, count: usize) -> Vec<MonitorEvent> {
        let skip = self.events.len().saturating_sub(count);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&MonitorEvent> {
        self.events.back()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}
