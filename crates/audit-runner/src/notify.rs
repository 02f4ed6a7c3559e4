use anyhow::{anyhow, Result};
use reqwest::blocking::Client as HttpClient;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PUSHOVER_ENDPOINT: &str = "https://api.pushover.net/1/messages.json";
const PUSHOVER_TIMEOUT_SECS: u64 = 10;
const MAX_ERROR_BODY_CHARS: usize = 512;

pub const MESSAGE_COMPLETED: &str = "Successfully finished an experiment";
pub const MESSAGE_BLOCK_FAILED: &str = "Error encountered in experiment";
pub const MESSAGE_INTERRUPTED: &str = "Experiment stopped before completion";

/// Operator alerts for block and process level events.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str) -> Result<()>;
}

/// Sends `message`, logging instead of propagating a delivery failure.
pub fn notify_quietly(notifier: &dyn Notifier, message: &str) {
    if let Err(err) = notifier.notify(message) {
        warn!(notification = message, error = %format!("{:#}", err), "notification failed");
    }
}

#[derive(Serialize)]
struct PushoverMessage<'a> {
    token: &'a str,
    user: &'a str,
    message: &'a str,
}

pub struct PushoverNotifier {
    endpoint: String,
    user: String,
    token: String,
    client: HttpClient,
}

impl PushoverNotifier {
    pub fn new(user: &str, token: &str) -> Result<Self> {
        Self::with_endpoint(DEFAULT_PUSHOVER_ENDPOINT, user, token)
    }

    pub fn with_endpoint(endpoint: &str, user: &str, token: &str) -> Result<Self> {
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return Err(anyhow!("pushover endpoint must not be empty"));
        }
        if user.trim().is_empty() || token.trim().is_empty() {
            return Err(anyhow!("pushover user and token must not be empty"));
        }
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(PUSHOVER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            endpoint,
            user: user.trim().to_string(),
            token: token.trim().to_string(),
            client,
        })
    }
}

impl Notifier for PushoverNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        let payload = PushoverMessage {
            token: &self.token,
            user: &self.user,
            message,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .map_err(|err| anyhow!("pushover POST {} transport error: {}", self.endpoint, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .map(|value| truncate_error_body(&value))
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            return Err(anyhow!(
                "pushover POST {} failed: status={} body={}",
                self.endpoint,
                status.as_u16(),
                body
            ));
        }
        info!(notification = message, "operator notified");
        Ok(())
    }
}

/// Used when no push credentials are configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        info!(notification = message, "notification sent to log");
        Ok(())
    }
}

pub(crate) fn truncate_error_body(raw: &str) -> String {
    let normalized = raw.replace('\n', " ");
    if normalized.chars().count() <= MAX_ERROR_BODY_CHARS {
        return normalized;
    }
    normalized.chars().take(MAX_ERROR_BODY_CHARS).collect()
}
