use tokio::sync::broadcast;
use tracing::debug;

use navi_core::results::HazardAlert;

const DEFAULT_CAPACITY: usize = 256;

/// Process-wide broadcast of hazard alerts. Each orchestration connection
/// subscribes and forwards the alerts that belong to its session.
#[derive(Clone)]
pub struct HazardBus {
    tx: broadcast::Sender<HazardAlert>,
}

impl HazardBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an alert. Returns the number of subscribers that received it.
    pub fn publish(&self, alert: HazardAlert) -> usize {
        match self.tx.send(alert) {
            Ok(n) => n,
            Err(_) => {
                debug!("hazard alert published with no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HazardAlert> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for HazardBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use navi_core::ids::SessionId;
    use navi_core::results::{Hazard, Urgency};

    fn alert(sid: &str) -> HazardAlert {
        HazardAlert {
            session_id: SessionId::from_raw(sid),
            hazard: Hazard {
                kind: "stairs".into(),
                bearing: Some("ahead".into()),
                distance_feet: Some(4.0),
                urgency: Urgency::Critical,
                approach: None,
            },
            source: "report_hazard".into(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_alerts() {
        let bus = HazardBus::default();
        let mut rx = bus.subscribe();
        assert_eq!(bus.publish(alert("nav_a")), 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.session_id.as_str(), "nav_a");
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let bus = HazardBus::new(4);
        assert_eq!(bus.publish(alert("nav_b")), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
