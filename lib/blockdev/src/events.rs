// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous notifications raised by the block layer.

use serde::Serialize;

use crate::job::JobKind;
use crate::node::ErrorAction;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockJobEventInfo {
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub device: String,
    pub len: u64,
    pub offset: u64,
    pub speed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IoOperation {
    Read,
    Write,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockEvent {
    BlockJobCompleted(BlockJobEventInfo),
    BlockJobCancelled(BlockJobEventInfo),
    BlockJobReady(BlockJobEventInfo),
    BlockJobError {
        device: String,
        operation: IoOperation,
        action: ErrorAction,
    },
}

impl BlockEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BlockEvent::BlockJobCompleted(_) => "BLOCK_JOB_COMPLETED",
            BlockEvent::BlockJobCancelled(_) => "BLOCK_JOB_CANCELLED",
            BlockEvent::BlockJobReady(_) => "BLOCK_JOB_READY",
            BlockEvent::BlockJobError { .. } => "BLOCK_JOB_ERROR",
        }
    }

    pub fn device(&self) -> &str {
        match self {
            BlockEvent::BlockJobCompleted(info)
            | BlockEvent::BlockJobCancelled(info)
            | BlockEvent::BlockJobReady(info) => &info.device,
            BlockEvent::BlockJobError { device, .. } => device,
        }
    }
}

/// A snapshot of a running job, as reported by `query_block_jobs`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockJobInfo {
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub device: String,
    pub len: u64,
    pub offset: u64,
    pub busy: bool,
    pub paused: bool,
    pub speed: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let ev = BlockEvent::BlockJobCompleted(BlockJobEventInfo {
            kind: JobKind::Stream,
            device: "virtio0".into(),
            len: 100,
            offset: 100,
            speed: 0,
            error: None,
        });
        assert_eq!(ev.name(), "BLOCK_JOB_COMPLETED");
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            serde_json::json!({
                "event": "BLOCK_JOB_COMPLETED",
                "data": {
                    "type": "stream",
                    "device": "virtio0",
                    "len": 100,
                    "offset": 100,
                    "speed": 0,
                }
            })
        );

        let ev = BlockEvent::BlockJobError {
            device: "ide0-hd0".into(),
            operation: IoOperation::Write,
            action: ErrorAction::Stop,
        };
        assert_eq!(ev.device(), "ide0-hd0");
        assert_eq!(
            serde_json::to_value(&ev).unwrap()["data"]["action"],
            "stop"
        );
    }
}
