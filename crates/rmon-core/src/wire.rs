//! Server to viewer frames.

use crate::event::MonitorEvent;
use crate::state::LoopState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub loops: BTreeMap<String, LoopState>,
    #[serde(rename = "recentEvents")]
    pub recent_events: BTreeMap<String, Vec<MonitorEvent>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot(Snapshot),
    Event {
        #[serde(rename = "loopId")]
        loop_id: String,
        event: MonitorEvent,
    },
    LoopStatus {
        #[serde(rename = "loopId")]
        loop_id: String,
        state: LoopState,
    },
    LoopRemoved {
        #[serde(rename = "loopId")]
        loop_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_shape() {
        let value = serde_json::to_value(ServerMessage::Snapshot(Snapshot::default()))
            .expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"type": "snapshot", "loops": {}, "recentEvents": {}})
        );
    }

    #[test]
    fn loop_removed_shape() {
        let msg = ServerMessage::LoopRemoved {
            loop_id: "vm:a.jsonl".to_string(),
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"type": "loop_removed", "loopId": "vm:a.jsonl"})
        );
    }
}
