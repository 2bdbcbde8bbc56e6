use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Event types relayed to the message broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    // Violation events
    ViolationRecorded,
    ViolationsCleared,

    // Ingestion processor events
    ProcessorStarted,
    ProcessorStopped,

    // System events
    SystemStartup,
    SystemShutdown,
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ViolationRecorded => write!(f, "violation.recorded"),
            Self::ViolationsCleared => write!(f, "violations.cleared"),
            Self::ProcessorStarted => write!(f, "processor.started"),
            Self::ProcessorStopped => write!(f, "processor.stopped"),
            Self::SystemStartup => write!(f, "system.startup"),
            Self::SystemShutdown => write!(f, "system.shutdown"),
        }
    }
}

/// Event message structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique event ID
    pub id: Uuid,
    pub event_type: EventType,
    /// Event source (a camera id for violation events)
    pub source_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

impl EventMessage {
    pub fn new(event_type: EventType, source_id: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source_id,
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    /// Get the routing key for the event
    pub fn routing_key(&self) -> String {
        match &self.source_id {
            Some(id) => format!("{}.{}", self.event_type, id),
            None => self.event_type.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys_carry_the_camera() {
        let event = EventMessage::new(
            EventType::ViolationRecorded,
            Some("cam_11".to_string()),
            serde_json::Value::Null,
        );
        assert_eq!(event.routing_key(), "violation.recorded.cam_11");

        let event = EventMessage::new(EventType::ViolationsCleared, None, serde_json::Value::Null);
        assert_eq!(event.routing_key(), "violations.cleared");
    }
}
