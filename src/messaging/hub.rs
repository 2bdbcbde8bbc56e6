use crate::db::models::ViolationView;
use log::{debug, warn};
use tokio::sync::broadcast::{self, error::RecvError};

/// Topic that receives every camera's violations
pub const TOPIC_ALL: &str = "all";

/// In-process fan-out of newly stored violations to live subscribers.
///
/// Delivery is best-effort: a subscriber that falls more than the channel
/// capacity behind skips the missed events, and nothing is queued for
/// subscribers that are not connected.
#[derive(Clone)]
pub struct LiveHub {
    tx: broadcast::Sender<ViolationView>,
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Notify subscribers; returns how many receivers the event was handed to
    pub fn publish(&self, violation: ViolationView) -> usize {
        let id = violation.id;
        match self.tx.send(violation) {
            Ok(receivers) => {
                debug!("Violation {} handed to {} live subscribers", id, receivers);
                receivers
            }
            // no subscribers connected
            Err(_) => 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscribe to `all` or to a single camera id
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        Subscription {
            topic: topic.into(),
            rx: self.tx.subscribe(),
        }
    }
}

pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<ViolationView>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn wants(&self, violation: &ViolationView) -> bool {
        self.topic == TOPIC_ALL || self.topic == violation.camera_id
    }

    /// Next violation for this topic; `None` once the hub is gone
    pub async fn next(&mut self) -> Option<ViolationView> {
        loop {
            match self.rx.recv().await {
                Ok(violation) if self.wants(&violation) => return Some(violation),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Live subscriber on '{}' lagged, skipped {} violations",
                        self.topic, skipped
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Breakdown, DEFAULT_STATUS};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn view(id: i64, camera_id: &str) -> ViolationView {
        ViolationView {
            id,
            camera_id: camera_id.to_string(),
            detected_at: Utc::now(),
            violations: Breakdown::new(),
            breakdown_valid: true,
            total_violations: 0,
            source_file: None,
            image_path: None,
            status: DEFAULT_STATUS.to_string(),
            created_at: Utc::now(),
        }
    }

    async fn nothing_pending(sub: &mut Subscription) -> bool {
        timeout(Duration::from_millis(50), sub.next()).await.is_err()
    }

    #[tokio::test]
    async fn each_matching_subscriber_gets_exactly_one_push() {
        let hub = LiveHub::new(16);
        let mut everything = hub.subscribe(TOPIC_ALL);
        let mut cam_11 = hub.subscribe("cam_11");
        let mut cam_28 = hub.subscribe("cam_28");

        assert_eq!(hub.publish(view(1, "cam_11")), 3);

        assert_eq!(everything.next().await.map(|v| v.id), Some(1));
        assert_eq!(cam_11.next().await.map(|v| v.id), Some(1));
        assert!(nothing_pending(&mut everything).await);
        assert!(nothing_pending(&mut cam_11).await);
        assert!(nothing_pending(&mut cam_28).await);
    }

    #[tokio::test]
    async fn disconnected_subscribers_miss_events() {
        let hub = LiveHub::new(16);
        let early = hub.subscribe(TOPIC_ALL);
        drop(early);
        assert_eq!(hub.publish(view(1, "cam_11")), 0);

        let mut late = hub.subscribe(TOPIC_ALL);
        assert!(nothing_pending(&mut late).await);
        hub.publish(view(2, "cam_11"));
        assert_eq!(late.next().await.map(|v| v.id), Some(2));
    }

    #[tokio::test]
    async fn lagging_subscriber_resumes_with_newest_events() {
        let hub = LiveHub::new(2);
        let mut slow = hub.subscribe(TOPIC_ALL);
        for id in 1..=5 {
            hub.publish(view(id, "cam_34"));
        }

        assert_eq!(slow.next().await.map(|v| v.id), Some(4));
        assert_eq!(slow.next().await.map(|v| v.id), Some(5));
    }
}
