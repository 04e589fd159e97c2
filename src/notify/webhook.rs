//! Reqwest-based webhook sink.
//!
//! Posts `{"subject": ..., "message": ...}` as JSON to a configured URL. The
//! receiving service owns the actual chat/email delivery.

use crate::notify::sink::NotificationSink;
use crate::GateError;
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    message: &'a str,
}

/// Notification sink that POSTs to a webhook.
pub struct WebhookSink {
    url: String,
    user_agent: String,
    timeout: Duration,
    // The blocking client must be built off the async workers, so it is
    // created on first delivery.
    client: OnceCell<Client>,
}

impl WebhookSink {
    /// Sink posting to `url`. Only `http` and `https` URLs are accepted.
    pub fn new(url: &str, product: &str) -> Result<Self, GateError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(GateError::ConfigError(format!(
                "webhook url must be http(s): {}",
                url
            )));
        }
        Ok(Self {
            url: url.to_string(),
            user_agent: build_user_agent(product),
            timeout: Duration::from_secs(10),
            client: OnceCell::new(),
        })
    }

    /// Set request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn client(&self) -> Result<&Client, GateError> {
        self.client.get_or_try_init(|| {
            Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| GateError::NotifyFailed(format!("Failed to create client: {}", e)))
        })
    }
}

impl NotificationSink for WebhookSink {
    fn notify(&self, subject: &str, message: &str) -> Result<(), GateError> {
        let response = self
            .client()?
            .post(&self.url)
            .header(USER_AGENT, &self.user_agent)
            .json(&WebhookPayload { subject, message })
            .send()
            .map_err(|e| GateError::NotifyFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GateError::NotifyFailed(format!(
                "webhook answered {}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

impl Drop for WebhookSink {
    fn drop(&mut self) {
        // The blocking client must not be torn down on an async worker.
        if let Some(client) = self.client.take() {
            std::thread::spawn(move || drop(client));
        }
    }
}

/// Build the User-Agent sent with webhook calls.
fn build_user_agent(product: &str) -> String {
    format!("{} subgate/{}", product, env!("CARGO_PKG_VERSION"))
}
