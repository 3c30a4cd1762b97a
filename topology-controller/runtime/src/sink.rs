use crate::core::{MetadataSink, PodReport};
use tracing::{debug, warn};

/// Pushes pod reports to the `/report` endpoint of the agent at a node-local address.
///
/// Delivery is fire and forget: a failure is logged and the report dropped; it is sent again
/// only when the underlying state changes.
pub struct HttpMetadataSink {
    client: reqwest::Client,
    port: u16,
}

impl HttpMetadataSink {
    pub fn new(port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
        }
    }
}

impl MetadataSink for HttpMetadataSink {
    fn publish(&self, agent_address: &str, reports: Vec<PodReport>) {
        let url = format!("http://{agent_address}:{}/report", self.port);
        let client = self.client.clone();
        tokio::spawn(async move {
            let count = reports.len();
            match client.post(&url).json(&reports).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%url, reports = count, "Delivered pod reports");
                }
                Ok(response) => {
                    warn!(%url, status = %response.status(), "Agent rejected pod reports");
                }
                Err(error) => {
                    warn!(%url, %error, "Failed to deliver pod reports");
                }
            }
        });
    }
}
