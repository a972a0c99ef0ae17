use crate::event::{EventKind, MonitorEvent, ToolCall, ToolPaired};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    timestamp: i64,
    loop_id: String,
    summary: String,
    call: ToolCall,
}

impl PendingCall {
    fn into_event(self) -> MonitorEvent {
        MonitorEvent {
            id: self.id,
            timestamp: self.timestamp,
            loop_id: self.loop_id,
            summary: self.summary,
            kind: EventKind::ToolCall(self.call),
        }
    }
}

/// Matches tool calls to their results within one loop.
#[derive(Debug)]
pub struct Pairer {
    pending: HashMap<String, PendingCall>,
    timeout_ms: i64,
}

impl Default for Pairer {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TIMEOUT)
    }
}

impl Pairer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn process(&mut self, event: MonitorEvent) -> MonitorEvent {
        let MonitorEvent {
            id,
            timestamp,
            loop_id,
            summary,
            kind,
        } = event;

        match kind {
            EventKind::ToolCall(call) => {
                self.pending.insert(
                    call.tool_use_id.clone(),
                    PendingCall {
                        id: id.clone(),
                        timestamp,
                        loop_id: loop_id.clone(),
                        summary: summary.clone(),
                        call: call.clone(),
                    },
                );
                MonitorEvent {
                    id,
                    timestamp,
                    loop_id,
                    summary,
                    kind: EventKind::ToolCall(call),
                }
            }
            EventKind::ToolResult(result) => match self.pending.remove(&result.tool_use_id) {
                Some(pending) => MonitorEvent {
                    id: pending.id,
                    timestamp: pending.timestamp,
                    loop_id: pending.loop_id,
                    summary: pending.summary,
                    kind: EventKind::ToolPaired(ToolPaired::from_parts(
                        pending.call,
                        result,
                        summary,
                    )),
                },
                None => MonitorEvent {
                    id,
                    timestamp,
                    loop_id,
                    summary,
                    kind: EventKind::ToolResult(result),
                },
            },
            kind => MonitorEvent {
                id,
                timestamp,
                loop_id,
                summary,
                kind,
            },
        }
    }

    /// Pending calls younger than the timeout, oldest first.
    pub fn pending(&self) -> Vec<MonitorEvent> {
        self.pending_at(crate::now_ms())
    }

    pub fn pending_at(&self, now_ms: i64) -> Vec<MonitorEvent> {
        let mut calls: Vec<MonitorEvent> = self
            .pending
            .values()
            .filter(|pending| now_ms - pending.timestamp < self.timeout_ms)
            .cloned()
            .map(PendingCall::into_event)
            .collect();
        calls.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        calls
    }

    /// Forgets calls older than the timeout. Returns how many were dropped.
    pub fn prune_stale(&mut self) -> usize {
        self.prune_stale_at(crate::now_ms())
    }

    pub fn prune_stale_at(&mut self, now_ms: i64) -> usize {
        let before = self.pending.len();
        let timeout_ms = self.timeout_ms;
        self.pending
            .retain(|_, pending| now_ms - pending.timestamp < timeout_ms);
        before - self.pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
