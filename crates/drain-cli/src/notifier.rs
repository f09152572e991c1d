//! Notifier client: forwards `incident.created` payloads to the notifier
//! service.
//!
//! The payload goes out unchanged as the JSON body. Any non-2xx answer is a
//! failed delivery, retried by the drain like every other failure.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use drain_core::domain::EventType;
use drain_core::ports::DeliveryHandler;
use reqwest::Client;
use tracing::{debug, error};

pub const INCIDENT_CREATED: &str = "incident.created";
pub const NEW_INCIDENT_PATH: &str = "/api/v1/events/new_incident";

pub struct NotifierClient {
    client: Client,
    new_incident_url: String,
}

impl NotifierClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build notifier HTTP client")?;

        Ok(Self {
            client,
            new_incident_url: format!("{}{NEW_INCIDENT_PATH}", base_url.trim_end_matches('/')),
        })
    }

    pub fn new_incident_url(&self) -> &str {
        &self.new_incident_url
    }
}

#[async_trait]
impl DeliveryHandler for NotifierClient {
    async fn deliver(
        &self,
        event_type: &EventType,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        debug!(%event_type, url = %self.new_incident_url, "posting to notifier");

        let response = self
            .client
            .post(&self.new_incident_url)
            .json(payload)
            .send()
            .await
            .context("notifier request failed")?;

        let status = response.status();
        let checked = response.error_for_status_ref().map(|_| ());
        if let Err(e) = checked {
            let detail = response.text().await.unwrap_or_default();
            error!(%status, %detail, "notifier API error");
            return Err(anyhow::Error::new(e).context(format!("notifier rejected event: {detail}")));
        }

        debug!(%status, "notifier accepted event");
        Ok(())
    }
}
