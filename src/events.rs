//! Commit event types broadcast to SSE subscribers
//!
//! When the response processor commits observations it publishes one frame
//! per observation on a process-wide broadcast channel. The `/stream`
//! endpoint wraps a receiver into a server-sent-event stream.
//!
//! Subscribers see a frame no earlier than the relational commit and no
//! later than the vector mirror attempt.

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Slow subscribers that fall more than
/// this many frames behind are lagged (they miss frames, they do not block
/// the processor).
const STREAM_CHANNEL_CAPACITY: usize = 256;

/// A committed observation, as seen by `/stream` subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationFrame {
    /// Always `"new_observation"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub observation: ObservationPayload,
    /// Commit time, epoch milliseconds.
    pub timestamp: i64,
}

/// The observation fields carried in a stream frame.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationPayload {
    pub id: i64,
    pub memory_session_id: String,
    pub project: String,
    #[serde(rename = "type")]
    pub observation_type: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
    pub created_at_epoch: i64,
}

impl ObservationFrame {
    pub fn new(observation: ObservationPayload, timestamp: i64) -> Self {
        Self {
            kind: "new_observation",
            observation,
            timestamp,
        }
    }
}

/// Sender half used by the response processor.
pub type FrameSender = broadcast::Sender<ObservationFrame>;

/// Create the broadcast channel for commit frames.
pub fn frame_channel() -> FrameSender {
    broadcast::channel(STREAM_CHANNEL_CAPACITY).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_serializes_with_type_tag() {
        let frame = ObservationFrame::new(
            ObservationPayload {
                id: 7,
                memory_session_id: "m1".into(),
                project: "demo".into(),
                observation_type: "discovery".into(),
                title: "T".into(),
                subtitle: None,
                narrative: Some("N".into()),
                created_at_epoch: 123,
            },
            456,
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "new_observation");
        assert_eq!(json["observation"]["type"], "discovery");
        assert_eq!(json["observation"]["title"], "T");
        assert!(json["observation"].get("subtitle").is_none());
        assert_eq!(json["timestamp"], 456);
    }
}
