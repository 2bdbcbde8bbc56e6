use crate::db::models::ViolationView;
use crate::messaging::{broker::MessageBrokerTrait, EventType};
use anyhow::Result;
use log::info;
use std::path::Path;
use std::sync::Arc;

/// Helper for publishing violation and processor events to the broker
pub struct ViolationEvents {
    message_broker: Arc<dyn MessageBrokerTrait>,
}

impl ViolationEvents {
    pub fn new(message_broker: Arc<dyn MessageBrokerTrait>) -> Self {
        Self { message_broker }
    }

    /// Publish a stored violation, routed as `violation.recorded.<camera_id>`
    pub async fn violation_recorded(&self, violation: &ViolationView) -> Result<()> {
        let payload = serde_json::to_value(violation)?;

        self.message_broker
            .publish(
                EventType::ViolationRecorded,
                Some(violation.camera_id.clone()),
                payload,
            )
            .await?;

        info!(
            "Published violation recorded event for {} (record {})",
            violation.camera_id, violation.id
        );
        Ok(())
    }

    pub async fn violations_cleared(&self, cleared_records: u64) -> Result<()> {
        let payload = serde_json::json!({
            "cleared_records": cleared_records,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.message_broker
            .publish(EventType::ViolationsCleared, None, payload)
            .await?;

        info!("Published violations cleared event ({} records)", cleared_records);
        Ok(())
    }

    pub async fn processor_started(&self, drop_dir: &Path, poll_interval_secs: u64) -> Result<()> {
        let payload = serde_json::json!({
            "drop_dir": drop_dir.display().to_string(),
            "poll_interval_secs": poll_interval_secs,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.message_broker
            .publish(EventType::ProcessorStarted, None, payload)
            .await
    }

    pub async fn processor_stopped(&self, processed_files: usize) -> Result<()> {
        let payload = serde_json::json!({
            "processed_files": processed_files,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.message_broker
            .publish(EventType::ProcessorStopped, None, payload)
            .await
    }

    pub async fn system_startup(&self) -> Result<()> {
        let payload = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.message_broker
            .publish(EventType::SystemStartup, None, payload)
            .await
    }

    pub async fn system_shutdown(&self) -> Result<()> {
        self.message_broker
            .publish(EventType::SystemShutdown, None, serde_json::json!({}))
            .await
    }
}
