use anyhow::Result;
use reqwest::blocking::Client as HttpClient;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONNECTIVITY_URL: &str = "http://www.google.com/";
const CONNECTIVITY_TIMEOUT_SECS: u64 = 5;

/// Cheap "are we online" check. Callers only log the answer.
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

pub struct HttpConnectivityProbe {
    url: String,
    client: HttpClient,
}

impl HttpConnectivityProbe {
    pub fn new(url: &str) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(CONNECTIVITY_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

impl ConnectivityProbe for HttpConnectivityProbe {
    fn is_online(&self) -> bool {
        match self.client.head(&self.url).send() {
            Ok(_) => true,
            Err(err) => {
                debug!(url = %self.url, error = %err, "connectivity probe failed");
                false
            }
        }
    }
}

pub struct AssumeOnline;

impl ConnectivityProbe for AssumeOnline {
    fn is_online(&self) -> bool {
        true
    }
}
