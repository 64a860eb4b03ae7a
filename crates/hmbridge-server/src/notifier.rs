//! Outbound notification when a designated parameter changes.

use hmbridge_types::DeviceEvent;
use std::time::Duration;
use thiserror::Error;

use crate::config::NotifierConfig;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification endpoint answered {0}")]
    Status(reqwest::StatusCode),
}

/// Fires a GET request carrying the device ID whenever the trigger
/// parameter changes.
///
/// Failures are logged and swallowed; there is no retry.
#[derive(Debug, Clone)]
pub struct TransitionNotifier {
    client: reqwest::Client,
    url: String,
    query_param: String,
    trigger_param: String,
}

impl TransitionNotifier {
    /// Builds a notifier from configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Request` if the HTTP client cannot be built.
    pub fn new(config: &NotifierConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            query_param: config.query_param.clone(),
            trigger_param: config.trigger_param.clone(),
        })
    }

    /// Whether `event` carries the trigger parameter.
    pub fn is_trigger(&self, event: &DeviceEvent) -> bool {
        event.param == self.trigger_param
    }

    /// Sends the notification if `event` is a trigger. Returns `true` only
    /// when a notification was sent and acknowledged.
    pub async fn notify(&self, event: &DeviceEvent) -> bool {
        if !self.is_trigger(event) {
            return false;
        }

        tracing::debug!(device_id = %event.device_id, value = %event.value, "sending transition notification");
        match self.send(&event.device_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    device_id = %event.device_id,
                    url = %self.url,
                    error = %e,
                    "transition notification failed"
                );
                false
            }
        }
    }

    async fn send(&self, device_id: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[(self.query_param.as_str(), device_id)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }
}
