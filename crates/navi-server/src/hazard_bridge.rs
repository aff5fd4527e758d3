use std::sync::Arc;

use navi_core::results::HazardAlert;
use navi_core::wire::EndpointFrame;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionRegistry;

/// Forwards published hazards to the connection that owns the session.
pub struct HazardBridge {
    registry: Arc<ConnectionRegistry>,
}

impl HazardBridge {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver one alert. Returns false when no connection took it.
    pub fn forward(&self, alert: HazardAlert) -> bool {
        let session_id = alert.session_id.clone();
        self.registry
            .send_to(&session_id, EndpointFrame::HazardAlert(alert).to_json())
    }

    pub fn start(
        self,
        rx: broadcast::Receiver<HazardAlert>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut alerts = BroadcastStream::new(rx);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = alerts.next() => next,
                };
                match next {
                    Some(Ok(alert)) => {
                        let _ = self.forward(alert);
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                        tracing::warn!(skipped = n, "hazard bridge lagged, dropped alerts");
                    }
                    None => {
                        tracing::info!("hazard bus closed");
                        break;
                    }
                }
            }
        })
    }
}
